//! Next-token selection for the decode loop.
//!
//! A single greedy user gets an argmax fused into the decode trace, so the
//! host only ever reads back one token id. Everything else reads row-major
//! logits back through the transfer queue and samples on the host with one
//! seeded RNG per batch slot.

use rand::rngs::StdRng;

use meshinfer::{ArgmaxOps, HostLogits, Result, SamplingParams};

/// Where the next token is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Argmax inside the trace, written into the next-token tensor.
    DeviceArgmax,
    /// Logits read back and sampled on the host.
    Host,
}

/// Per-batch sampler state.
pub struct Sampler {
    mode: SamplingMode,
    params: SamplingParams,
    rngs: Vec<StdRng>,
}

impl Sampler {
    #[must_use]
    pub fn new(params: SamplingParams, batch_size: usize, argmax_on_device: bool) -> Self {
        let mode = if argmax_on_device {
            SamplingMode::DeviceArgmax
        } else {
            SamplingMode::Host
        };
        Self {
            mode,
            params,
            rngs: params.user_rngs(batch_size),
        }
    }

    #[must_use]
    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    #[must_use]
    pub fn on_device(&self) -> bool {
        self.mode == SamplingMode::DeviceArgmax
    }

    #[must_use]
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Re-seed every user's stream so a repeated batch draws the same tokens.
    pub fn reset(&mut self) {
        self.rngs = self.params.user_rngs(self.rngs.len());
    }

    /// One token per row of `logits`.
    pub fn sample(&mut self, logits: &HostLogits) -> Vec<u32> {
        let params = self.params;
        self.rngs
            .iter_mut()
            .take(logits.batch_size())
            .enumerate()
            .map(|(user, rng)| logits.sample(user, &params, rng))
            .collect()
    }
}

/// Enqueue the fused argmax: row-major replicated logits into the `U32`
/// next-token tensor.
///
/// # Errors
/// Returns an error if the logits are not row-major and replicated or the
/// output does not hold one id per row.
pub fn device_argmax<B: ArgmaxOps>(logits: &B::Tensor, next_tokens: &B::Tensor) -> Result<()> {
    B::argmax_into(logits, next_tokens)
}

#[cfg(test)]
mod tests {
    use meshinfer::{DType, HostData, Layout, LayoutOps, MeshControl, Tensor, TensorIo, TensorSpec};
    use meshinfer_sim::{MeshConfig, SimBackend, SimMesh};

    use super::*;

    fn logits_rows(batch: usize, vocab: usize) -> Vec<f32> {
        (0..batch * vocab)
            .map(|i| ((i * 37 + 11) % 101) as f32 / 7.0 - 3.0)
            .collect()
    }

    #[test]
    fn test_greedy_device_and_host_agree() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let (batch, vocab) = (4, 64);
        let data = logits_rows(batch, vocab);
        let logits = SimBackend::from_host(
            &mesh,
            &[1, 1, batch, vocab],
            HostData::F32(data.clone()),
            TensorSpec::new(DType::F32),
        )
        .unwrap();
        let logits = SimBackend::to_layout(&logits, Layout::RowMajor).unwrap();
        let out = SimBackend::zeros(&mesh, &[1, batch], TensorSpec::new(DType::U32).row_major()).unwrap();
        device_argmax::<SimBackend>(&logits, &out).unwrap();
        mesh.synchronize().unwrap();
        let on_device = SimBackend::to_host(&out).unwrap().into_u32().unwrap();

        let mut sampler = Sampler::new(SamplingParams::greedy(), batch, false);
        let on_host = sampler.sample(&HostLogits::new(data, vocab).unwrap());
        assert_eq!(on_device, on_host);
        assert_eq!(out.shape(), &[1, batch]);
    }

    #[test]
    fn test_reset_replays_the_same_draws() {
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            seed: 5,
        };
        let logits = HostLogits::new(logits_rows(3, 32), 32).unwrap();
        let mut sampler = Sampler::new(params, 3, false);
        let first: Vec<Vec<u32>> = (0..6).map(|_| sampler.sample(&logits)).collect();
        sampler.reset();
        let second: Vec<Vec<u32>> = (0..6).map(|_| sampler.sample(&logits)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mode_follows_flag() {
        assert!(Sampler::new(SamplingParams::greedy(), 1, true).on_device());
        assert_eq!(
            Sampler::new(SamplingParams::greedy(), 8, false).mode(),
            SamplingMode::Host
        );
    }
}
