//! Sampling parameters and host-side sampling over a logits matrix

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Parameters for nucleus (top-p) sampling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for logit scaling (higher = more random). `0` means greedy.
    pub temperature: f32,
    /// Nucleus probability threshold in (0, 1]. Only tokens within the top-p
    /// cumulative probability mass are considered.
    pub top_p: f32,
    /// Seed for the PRNG. Same seed + same input → same output.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.08,
            seed: 42,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding.
    #[must_use]
    pub fn greedy() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// # Errors
    /// Returns a configuration error for a negative temperature or a `top_p`
    /// outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(Error::config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    /// One reproducible RNG stream per batch slot.
    #[must_use]
    pub fn user_rngs(&self, batch_size: usize) -> Vec<StdRng> {
        (0..batch_size as u64)
            .map(|user| StdRng::seed_from_u64(self.seed.wrapping_add(user)))
            .collect()
    }
}

/// Row-major `[batch, vocab]` logits copied to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostLogits {
    data: Vec<f32>,
    vocab_size: usize,
}

impl HostLogits {
    /// # Errors
    /// Returns an error if `data` is not a whole number of rows.
    pub fn new(data: Vec<f32>, vocab_size: usize) -> Result<Self> {
        if vocab_size == 0 || data.len() % vocab_size != 0 {
            return Err(Error::InvalidShape(format!(
                "{} logits do not form rows of {vocab_size}",
                data.len()
            )));
        }
        Ok(Self { data, vocab_size })
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.data.len() / self.vocab_size
    }

    #[must_use]
    pub fn row(&self, batch_index: usize) -> &[f32] {
        let start = batch_index * self.vocab_size;
        &self.data[start..start + self.vocab_size]
    }

    /// Index of the largest logit; ties go to the lowest index.
    #[must_use]
    pub fn argmax(&self, batch_index: usize) -> u32 {
        argmax(self.row(batch_index))
    }

    /// Greedy when `params.temperature == 0`, otherwise temperature + top-p.
    pub fn sample(&self, batch_index: usize, params: &SamplingParams, rng: &mut StdRng) -> u32 {
        if params.is_greedy() {
            return self.argmax(batch_index);
        }
        sample_top_p(self.row(batch_index), params.temperature, params.top_p, rng)
    }
}

/// Index of the largest value; ties go to the lowest index.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn argmax(row: &[f32]) -> u32 {
    let mut max_idx = 0usize;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    max_idx as u32
}

#[allow(clippy::cast_possible_truncation)]
fn sample_top_p(row: &[f32], temperature: f32, top_p: f32, rng: &mut StdRng) -> u32 {
    // Softmax with temperature
    let max_logit = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = row
        .iter()
        .map(|l| ((l - max_logit) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }

    // Sort by probability descending
    let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    // Top-p nucleus
    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            cutoff = i + 1;
            break;
        }
    }
    let nucleus = &indexed[..cutoff];

    // Renormalize and draw
    let nucleus_sum: f32 = nucleus.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.gen();
    let mut cumul = 0.0;
    for &(idx, p) in nucleus {
        cumul += p / nucleus_sum;
        if cumul >= r {
            return idx as u32;
        }
    }

    // Fallback: most probable
    nucleus[0].0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        assert_eq!(argmax(&[0.0, 3.0, 3.0, 1.0]), 1);
        assert_eq!(argmax(&[-1.0]), 0);
    }

    #[test]
    fn test_greedy_sample_equals_argmax() {
        let logits = HostLogits::new(vec![0.1, 0.9, 0.3, 2.0, -1.0, 0.0], 3).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let params = SamplingParams::greedy();
        assert_eq!(logits.batch_size(), 2);
        assert_eq!(logits.sample(0, &params, &mut rng), 1);
        assert_eq!(logits.sample(1, &params, &mut rng), 0);
    }

    #[test]
    fn test_tiny_top_p_picks_the_mode() {
        let logits = HostLogits::new(vec![0.0, 5.0, 1.0, 0.5], 4).unwrap();
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.01,
            seed: 7,
        };
        let mut rng = StdRng::seed_from_u64(params.seed);
        for _ in 0..16 {
            assert_eq!(logits.sample(0, &params, &mut rng), 1);
        }
    }

    #[test]
    fn test_sampling_is_reproducible_per_seed() {
        let row: Vec<f32> = (0..32).map(|i| (i % 5) as f32 * 0.3).collect();
        let logits = HostLogits::new(row, 32).unwrap();
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            seed: 3,
        };
        let draw = |params: &SamplingParams| {
            let mut rng = params.user_rngs(1).remove(0);
            (0..8)
                .map(|_| logits.sample(0, params, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(&params), draw(&params));
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let mut p = SamplingParams::default();
        assert!(p.validate().is_ok());
        p.top_p = 0.0;
        assert!(p.validate().is_err());
        p.top_p = 0.5;
        p.temperature = -1.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_ragged_logits_rejected() {
        assert!(HostLogits::new(vec![0.0; 5], 2).is_err());
    }
}
