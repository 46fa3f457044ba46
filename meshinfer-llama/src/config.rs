//! Llama model configuration

use serde::Deserialize;
use std::path::Path;

use meshinfer::dtype::DType;
use meshinfer::model_args::{ModelArgs, Optimizations};
use meshinfer::rope::RopeScaling;
use meshinfer::{Error, Result};

/// Configuration for Llama models
///
/// Parsed from the model's `config.json` file
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    /// Vocabulary size
    pub vocab_size: usize,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Intermediate size for MLP (FFN)
    pub intermediate_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA, defaults to `num_attention_heads`)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Per-head dimension, when it differs from `hidden_size / num_attention_heads`
    #[serde(default)]
    pub head_dim: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,

    /// Rotary position embedding base frequency
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    /// Llama-3.1 frequency scaling
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,

    /// Tie word embeddings with `lm_head`
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Beginning of sequence token ID
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,

    /// End of sequence token ID(s)
    #[serde(default = "default_eos_token_id", deserialize_with = "one_or_many")]
    pub eos_token_id: Vec<u32>,
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_bos_token_id() -> u32 {
    1
}

fn default_eos_token_id() -> Vec<u32> {
    vec![2]
}

/// Llama-3 instruct configs list several end-of-sequence ids.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

impl LlamaConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the number of key-value heads (for grouped-query attention)
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get the head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Short size label ("1B", "8B", ...) used to look up perf targets.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn size_label(&self) -> String {
        let per_layer = 4 * self.hidden_size * self.hidden_size
            + 3 * self.hidden_size * self.intermediate_size;
        let embed = self.vocab_size * self.hidden_size;
        let params = per_layer * self.num_hidden_layers + embed;
        let billions = (params as f64 / 1e9).round().max(1.0);
        format!("{billions}B")
    }

    /// Derive the engine's hyper-parameters for a batch and context length.
    ///
    /// # Errors
    /// Returns a configuration error if `max_seq_len` exceeds the model's
    /// `max_position_embeddings`.
    pub fn to_model_args(
        &self,
        max_batch_size: usize,
        max_seq_len: usize,
        optimizations: Optimizations,
    ) -> Result<ModelArgs> {
        if max_seq_len > self.max_position_embeddings {
            return Err(Error::config(format!(
                "max_seq_len {max_seq_len} exceeds the model's max_position_embeddings {}",
                self.max_position_embeddings
            )));
        }
        Ok(ModelArgs {
            model_name: self.size_label(),
            num_layers: self.num_hidden_layers,
            dim: self.hidden_size,
            n_heads: self.num_attention_heads,
            n_kv_heads: self.num_kv_heads(),
            head_dim: self.head_dim(),
            hidden_dim: self.intermediate_size,
            vocab_size: self.vocab_size,
            max_seq_len,
            max_batch_size,
            norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            use_scaled_rope: self.rope_scaling.is_some(),
            rope_scaling: self.rope_scaling,
            optimizations,
            kv_cache_dtype: DType::BFP8,
            weights_dtype: DType::BF16,
        })
    }
}
