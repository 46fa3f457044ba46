//! Immutable model hyper-parameters consumed by the model and the engine.

use serde::{Deserialize, Serialize};

use crate::backend::MathFidelity;
use crate::dtype::DType;
use crate::mesh::MeshShape;
use crate::rope::RopeScaling;
use crate::tensor::{CoreGrid, MemoryConfig, ShardSpec, ShardStrategy, TILE_WIDTH};
use crate::{Error, Result};

/// Largest batch a single generator instance serves.
pub const MAX_BATCH_SIZE: usize = 32;

/// Precision/speed trade-off for weights and matmul math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizations {
    /// 4-bit block-float MLP weights and LoFi matmuls.
    #[default]
    Performance,
    /// 8-bit block-float MLP weights and HiFi2 matmuls.
    Accuracy,
}

/// Paged-attention geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
    /// Tokens per KV block.
    pub page_block_size: usize,
    /// Blocks in the pool, per layer and per K/V.
    pub page_max_num_blocks: usize,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page_block_size: 32,
            page_max_num_blocks: 1024,
        }
    }
}

/// Hyper-parameters of a Llama-family model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Short name used to look up perf targets ("1B", "8B", ...).
    pub model_name: String,
    pub num_layers: usize,
    pub dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Feed-forward inner dimension.
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
    pub norm_eps: f32,
    pub rope_theta: f32,
    pub use_scaled_rope: bool,
    pub rope_scaling: Option<RopeScaling>,
    pub optimizations: Optimizations,
    /// Element type of the KV-cache pool.
    pub kv_cache_dtype: DType,
    /// Element type of the embedding table, norm gains and activations.
    /// `F32` keeps every weight unquantized.
    pub weights_dtype: DType,
}

impl ModelArgs {
    /// Check the arguments are usable on `mesh`.
    ///
    /// # Errors
    /// Returns a configuration error citing the offending value.
    pub fn validate(&self, mesh: MeshShape) -> Result<()> {
        let devices = mesh.num_devices();
        if self.num_layers == 0 || self.dim == 0 || self.vocab_size == 0 {
            return Err(Error::config(format!(
                "model {} has an empty dimension (layers {}, dim {}, vocab {})",
                self.model_name, self.num_layers, self.dim, self.vocab_size
            )));
        }
        if self.n_heads * self.head_dim != self.dim {
            return Err(Error::config(format!(
                "n_heads {} * head_dim {} != dim {}",
                self.n_heads, self.head_dim, self.dim
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(Error::config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim
            )));
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            return Err(Error::config(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(Error::config(format!(
                "max_batch_size {} outside 1..={MAX_BATCH_SIZE}",
                self.max_batch_size
            )));
        }
        for (what, value) in [
            ("n_kv_heads", self.n_kv_heads),
            ("hidden_dim", self.hidden_dim),
            ("vocab_size", self.vocab_size),
        ] {
            if value % devices != 0 {
                return Err(Error::config(format!(
                    "device grid {mesh} mismatch: {what} {value} does not split over {devices} devices"
                )));
            }
        }
        if !self.weights_dtype.is_float() || !self.kv_cache_dtype.is_float() {
            return Err(Error::config(format!(
                "weights dtype {} and kv cache dtype {} must be floating point",
                self.weights_dtype, self.kv_cache_dtype
            )));
        }
        if self.use_scaled_rope && self.rope_scaling.is_none() {
            return Err(Error::config("use_scaled_rope set without rope_scaling"));
        }
        Ok(())
    }

    /// Dtype of the feed-forward weights.
    #[must_use]
    pub fn mlp_dtype(&self) -> DType {
        match (self.weights_dtype, self.optimizations) {
            (DType::F32, _) => DType::F32,
            (_, Optimizations::Performance) => DType::BFP4,
            (_, Optimizations::Accuracy) => DType::BFP8,
        }
    }

    /// Dtype of the attention projections and the output head.
    #[must_use]
    pub fn attention_dtype(&self) -> DType {
        if self.weights_dtype == DType::F32 {
            DType::F32
        } else {
            DType::BFP8
        }
    }

    /// Math fidelity of the feed-forward matmuls.
    #[must_use]
    pub fn mlp_fidelity(&self) -> MathFidelity {
        match self.optimizations {
            Optimizations::Performance => MathFidelity::LoFi,
            Optimizations::Accuracy => MathFidelity::HiFi2,
        }
    }

    /// Rope scaling in effect, if any.
    #[must_use]
    pub fn effective_rope_scaling(&self) -> Option<&RopeScaling> {
        if self.use_scaled_rope {
            self.rope_scaling.as_ref()
        } else {
            None
        }
    }

    /// Softmax scale for attention.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn attention_scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// L1 width-sharded placement of the `[1, 1, batch, dim]` decode residual.
    ///
    /// Uses the most cores that evenly divide the residual's tile columns and
    /// fit in `grid`.
    #[must_use]
    pub fn decode_residual_memory(&self, grid: CoreGrid) -> MemoryConfig {
        let dim_tiles = self.dim.div_ceil(TILE_WIDTH);
        let cores = (1..=dim_tiles.min(grid.num_cores()))
            .rev()
            .find(|&n| dim_tiles % n == 0 && (n <= grid.x || (n % grid.x == 0 && n / grid.x <= grid.y)))
            .unwrap_or(1);
        let core_grid = if cores <= grid.x {
            CoreGrid::new(cores, 1)
        } else {
            CoreGrid::new(grid.x, cores / grid.x)
        };
        MemoryConfig::L1Sharded(ShardSpec {
            grid: core_grid,
            shard_shape: [self.max_batch_size.next_multiple_of(32), dim_tiles / cores * TILE_WIDTH],
            strategy: ShardStrategy::Width,
        })
    }

    /// Llama-3.2-1B shaped arguments.
    #[must_use]
    pub fn llama_3_2_1b(max_batch_size: usize, max_seq_len: usize) -> Self {
        Self {
            model_name: "1B".into(),
            num_layers: 16,
            dim: 2048,
            n_heads: 32,
            n_kv_heads: 8,
            head_dim: 64,
            hidden_dim: 8192,
            vocab_size: 128_256,
            max_seq_len,
            max_batch_size,
            norm_eps: 1e-5,
            rope_theta: 500_000.0,
            use_scaled_rope: true,
            rope_scaling: Some(RopeScaling {
                factor: 32.0,
                ..RopeScaling::default()
            }),
            optimizations: Optimizations::Performance,
            kv_cache_dtype: DType::BFP8,
            weights_dtype: DType::BF16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelArgs {
        ModelArgs {
            model_name: "tiny".into(),
            num_layers: 2,
            dim: 64,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 16,
            hidden_dim: 128,
            vocab_size: 264,
            max_seq_len: 256,
            max_batch_size: 8,
            norm_eps: 1e-5,
            rope_theta: 10_000.0,
            use_scaled_rope: false,
            rope_scaling: None,
            optimizations: Optimizations::Accuracy,
            kv_cache_dtype: DType::BF16,
            weights_dtype: DType::BF16,
        }
    }

    #[test]
    fn test_tiny_args_validate() {
        assert!(tiny().validate(MeshShape::new(1, 2)).is_ok());
        assert!(ModelArgs::llama_3_2_1b(1, 1024)
            .validate(MeshShape::new(1, 1))
            .is_ok());
    }

    #[test]
    fn test_grid_mismatch_is_config_error() {
        let err = tiny().validate(MeshShape::new(1, 4)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
        assert!(err.to_string().contains("n_kv_heads"));
    }

    #[test]
    fn test_batch_cap() {
        let mut args = tiny();
        args.max_batch_size = 64;
        let err = args.validate(MeshShape::new(1, 1)).unwrap_err();
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn test_optimizations_pick_dtypes() {
        let mut args = tiny();
        assert_eq!(args.mlp_dtype(), DType::BFP8);
        assert_eq!(args.mlp_fidelity(), MathFidelity::HiFi2);
        args.optimizations = Optimizations::Performance;
        assert_eq!(args.mlp_dtype(), DType::BFP4);
        assert_eq!(args.mlp_fidelity(), MathFidelity::LoFi);
        args.weights_dtype = DType::F32;
        assert_eq!(args.mlp_dtype(), DType::F32);
        assert_eq!(args.attention_dtype(), DType::F32);
    }

    #[test]
    fn test_decode_residual_sharding() {
        let args = tiny();
        let MemoryConfig::L1Sharded(spec) = args.decode_residual_memory(CoreGrid::new(8, 8)) else {
            panic!("expected sharded residual");
        };
        // 64 / 32 = 2 tile columns over 2 cores
        assert_eq!(spec.grid, CoreGrid::new(2, 1));
        assert_eq!(spec.shard_shape, [32, 32]);
    }
}
