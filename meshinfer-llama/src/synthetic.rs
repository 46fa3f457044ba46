//! Seeded random Llama checkpoints for tests, demos and benchmarks.

use meshinfer::model_args::ModelArgs;
use meshinfer::weights::{Init, SyntheticWeights};

/// Register every tensor a Llama checkpoint with `args` carries, using the
/// HuggingFace names and `[out, in]` layout. Linear weights are uniform in
/// `±1/sqrt(in)`; norm gains are one. The head is tied to the embedding.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_weights(args: &ModelArgs, seed: u64) -> SyntheticWeights {
    let bound = |fan_in: usize| Init::Uniform(1.0 / (fan_in as f32).sqrt());
    let q_dim = args.n_heads * args.head_dim;
    let kv_dim = args.n_kv_heads * args.head_dim;

    let mut weights = SyntheticWeights::new(seed)
        .with_tensor("model.embed_tokens.weight", vec![args.vocab_size, args.dim], Init::Uniform(1.0))
        .with_tensor("model.norm.weight", vec![args.dim], Init::Constant(1.0));
    for i in 0..args.num_layers {
        let p = format!("model.layers.{i}");
        for (name, shape, init) in [
            ("input_layernorm", vec![args.dim], Init::Constant(1.0)),
            ("post_attention_layernorm", vec![args.dim], Init::Constant(1.0)),
            ("self_attn.q_proj", vec![q_dim, args.dim], bound(args.dim)),
            ("self_attn.k_proj", vec![kv_dim, args.dim], bound(args.dim)),
            ("self_attn.v_proj", vec![kv_dim, args.dim], bound(args.dim)),
            ("self_attn.o_proj", vec![args.dim, q_dim], bound(q_dim)),
            ("mlp.gate_proj", vec![args.hidden_dim, args.dim], bound(args.dim)),
            ("mlp.up_proj", vec![args.hidden_dim, args.dim], bound(args.dim)),
            ("mlp.down_proj", vec![args.dim, args.hidden_dim], bound(args.hidden_dim)),
        ] {
            weights.insert(format!("{p}.{name}.weight"), shape, init);
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use meshinfer::{DType, Optimizations, WeightProvider};

    use super::*;

    #[test]
    fn test_registers_every_layer() {
        let args = ModelArgs {
            model_name: "tiny".into(),
            num_layers: 2,
            dim: 32,
            n_heads: 2,
            n_kv_heads: 1,
            head_dim: 16,
            hidden_dim: 64,
            vocab_size: 264,
            max_seq_len: 128,
            max_batch_size: 1,
            norm_eps: 1e-5,
            rope_theta: 10_000.0,
            use_scaled_rope: false,
            rope_scaling: None,
            optimizations: Optimizations::Accuracy,
            kv_cache_dtype: DType::F32,
            weights_dtype: DType::F32,
        };
        let w = synthetic_weights(&args, 7);
        assert!(w.contains("model.layers.1.mlp.down_proj.weight"));
        assert!(!w.contains("lm_head.weight"));
        let k = w.tensor("model.layers.0.self_attn.k_proj.weight").unwrap();
        assert_eq!(k.shape, vec![16, 32]);
        let bound = 1.0 / 32.0_f32.sqrt();
        assert!(k.data.iter().all(|v| v.abs() <= bound));
    }
}
