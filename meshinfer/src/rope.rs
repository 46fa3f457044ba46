//! RoPE (Rotary Positional Embeddings) precomputation.
//!
//! Pure host-side computation of the cos/sin tables and the rotation basis
//! matrix. The runtime uploads the results once per model and gathers rows
//! from them on device by position index.

#![allow(clippy::cast_precision_loss, clippy::doc_markdown)]

use serde::{Deserialize, Serialize};

/// Llama-3.1 style frequency scaling (the `rope_scaling` block of `config.json`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    /// Extension factor applied to low-frequency bands
    pub factor: f32,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f32,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f32,
    /// Context length the base model was trained with
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

fn default_low_freq_factor() -> f32 {
    1.0
}

fn default_high_freq_factor() -> f32 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self {
            factor: 8.0,
            low_freq_factor: default_low_freq_factor(),
            high_freq_factor: default_high_freq_factor(),
            original_max_position_embeddings: default_original_max_position_embeddings(),
        }
    }
}

impl RopeScaling {
    /// Rescale one inverse frequency.
    ///
    /// High-frequency bands (short wavelengths) are kept, low-frequency bands
    /// are divided by `factor`, and the band in between is interpolated.
    #[must_use]
    pub fn scale_frequency(&self, freq: f32) -> f32 {
        let old_ctx = self.original_max_position_embeddings as f32;
        let low_freq_wavelen = old_ctx / self.low_freq_factor;
        let high_freq_wavelen = old_ctx / self.high_freq_factor;
        let wavelen = 2.0 * std::f32::consts::PI / freq;
        if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / self.factor
        } else {
            let smooth = (old_ctx / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * freq / self.factor + smooth * freq
        }
    }
}

/// Precompute the cos/sin tables.
///
/// Returns `(cos, sin)` each of length `max_seq_len * (head_dim / 2)`,
/// stored in row-major order `[max_seq_len, head_dim / 2]`.
#[must_use]
pub fn precompute(
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
    scaling: Option<&RopeScaling>,
) -> (Vec<f32>, Vec<f32>) {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| {
            let freq = 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32);
            scaling.map_or(freq, |s| s.scale_frequency(freq))
        })
        .collect();

    let mut cos = vec![0.0_f32; max_seq_len * half_dim];
    let mut sin = vec![0.0_f32; max_seq_len * half_dim];
    for pos in 0..max_seq_len {
        for (i, freq) in freqs.iter().enumerate() {
            let angle = pos as f32 * freq;
            cos[pos * half_dim + i] = angle.cos();
            sin[pos * half_dim + i] = angle.sin();
        }
    }
    (cos, sin)
}

/// Widen a `[rows, head_dim / 2]` table to `[rows, head_dim]` by repeating
/// each row's halves, the form the rotary kernel multiplies against.
#[must_use]
pub fn duplicate_halves(table: &[f32], head_dim: usize) -> Vec<f32> {
    let half_dim = head_dim / 2;
    let mut out = Vec::with_capacity(table.len() * 2);
    for row in table.chunks_exact(half_dim) {
        out.extend_from_slice(row);
        out.extend_from_slice(row);
    }
    out
}

/// `[head_dim, head_dim]` matrix `T` such that `x @ T` is the half rotation
/// `[-x[d/2..], x[..d/2]]`.
#[must_use]
pub fn rotation_matrix(head_dim: usize) -> Vec<f32> {
    let half_dim = head_dim / 2;
    let mut m = vec![0.0_f32; head_dim * head_dim];
    for j in 0..half_dim {
        // out[j] = -x[j + half]
        m[(j + half_dim) * head_dim + j] = -1.0;
        // out[j + half] = x[j]
        m[j * head_dim + j + half_dim] = 1.0;
    }
    m
}
