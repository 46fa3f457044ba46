//! Llama model implementation
//!
//! Tensor-parallel over every device of the mesh. Projections that produce
//! heads (`wq`, `wk`, `wv`) and the MLP inputs (`w1`, `w3`) are split along
//! their output columns; `wo` and `w2` are split along their input rows and
//! their partial sums are combined with `all_reduce`. The output head is
//! split along the vocabulary, so logits leave the model sharded and the
//! engine gathers them. The embedding table and the norm gains are
//! replicated.

#![allow(
    clippy::struct_field_names, // _proj suffix is conventional for Llama weights
    clippy::doc_markdown // tensor shape docs trigger false positives
)]

use std::path::Path;

use meshinfer::backend::{Activation, Backend, KernelRuntime, MathFidelity, MatmulConfig, SemaphoreOf};
use meshinfer::host::HostData;
use meshinfer::mesh::{CollectiveSetup, Topology};
use meshinfer::model::{LayerKvCache, Model, RotationInputs, TensorOf};
use meshinfer::model_args::ModelArgs;
use meshinfer::tensor::{Layout, MeshMapping, Tensor, TensorSpec, TILE_HEIGHT};
use meshinfer::weights::{SafeTensorsProvider, WeightProvider};
use meshinfer::{DType, Error, MeshControl, Result};

use crate::LlamaConfig;

/// Rows of the prefill output that pass through the output head.
const LAST_TOKEN_TILE: usize = TILE_HEIGHT;

/// Weights for a single Llama attention layer, stored `[1, 1, in, out]`
struct LlamaAttentionWeights<T> {
    q_proj: T,
    k_proj: T,
    v_proj: T,
    o_proj: T,
}

/// Weights for a single Llama MLP layer, stored `[1, 1, in, out]`
struct LlamaMlpWeights<T> {
    gate_proj: T,
    up_proj: T,
    down_proj: T,
}

/// Weights for a single Llama decoder layer
struct LlamaLayerWeights<T> {
    input_layernorm: T,
    attention: LlamaAttentionWeights<T>,
    post_attention_layernorm: T,
    mlp: LlamaMlpWeights<T>,
}

/// Complete Llama model on backend `B`
pub struct LlamaModel<B: KernelRuntime> {
    args: ModelArgs,
    mesh: B::Mesh,
    ccl: CollectiveSetup<SemaphoreOf<B>>,

    embed_tokens: B::Tensor,
    layers: Vec<LlamaLayerWeights<B::Tensor>>,
    norm: B::Tensor,
    lm_head: B::Tensor,

    attention_matmul: MatmulConfig,
    mlp_matmul: MatmulConfig,
    head_matmul: MatmulConfig,
}

/// Uploads provider tensors with the placement each weight needs.
struct Loader<'a, B: KernelRuntime, P: WeightProvider + ?Sized> {
    mesh: &'a B::Mesh,
    provider: &'a P,
}

impl<B: KernelRuntime, P: WeightProvider + ?Sized> Loader<'_, B, P> {
    /// `[out, in]` checkpoint weight → `[1, 1, in, out]` device weight.
    fn linear(&self, name: &str, dtype: DType, mapping: MeshMapping) -> Result<B::Tensor> {
        let host = self.provider.tensor(name)?.transpose_2d()?;
        let shape = [1, 1, host.shape[0], host.shape[1]];
        B::from_host(
            self.mesh,
            &shape,
            HostData::F32(host.data),
            TensorSpec::new(dtype).with_mapping(mapping),
        )
    }

    fn norm(&self, name: &str, dtype: DType) -> Result<B::Tensor> {
        let host = self.provider.tensor(name)?;
        let shape = [host.numel()];
        B::from_host(self.mesh, &shape, HostData::F32(host.data), TensorSpec::new(dtype).row_major())
    }

    fn table(&self, name: &str, dtype: DType) -> Result<B::Tensor> {
        let host = self.provider.tensor(name)?;
        if host.shape.len() != 2 {
            return Err(Error::InvalidShape(format!(
                "{name} must be [vocab, dim], got {:?}",
                host.shape
            )));
        }
        let shape = host.shape.clone();
        B::from_host(self.mesh, &shape, HostData::F32(host.data), TensorSpec::new(dtype))
    }
}

/// Column-parallel: each device holds a slice of the output features.
const SPLIT_COLUMNS: MeshMapping = MeshMapping::Shard { dim: 3 };
/// Row-parallel: each device holds a slice of the input features.
const SPLIT_ROWS: MeshMapping = MeshMapping::Shard { dim: 2 };

impl<B: KernelRuntime> LlamaModel<B> {
    /// Load a Llama model from a directory containing SafeTensors and config.json
    ///
    /// # Errors
    /// Returns an error if loading fails
    pub fn from_pretrained(
        mesh: &B::Mesh,
        model_path: impl AsRef<Path>,
        max_batch_size: usize,
        max_seq_len: usize,
        optimizations: meshinfer::Optimizations,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let config = LlamaConfig::from_file(model_path.join("config.json"))?;
        let args = config.to_model_args(max_batch_size, max_seq_len, optimizations)?;
        let provider = SafeTensorsProvider::from_directory(model_path)?;
        Self::load(mesh, args, &provider)
    }

    /// Upload every weight from `provider` onto `mesh`.
    ///
    /// # Errors
    /// Returns a configuration error if `args` does not fit the mesh, or the
    /// provider's error for a missing or malformed tensor.
    pub fn load<P: WeightProvider + ?Sized>(
        mesh: &B::Mesh,
        args: ModelArgs,
        provider: &P,
    ) -> Result<Self> {
        args.validate(mesh.shape())?;
        log::info!(
            "Loading Llama {} ({} layers) from {} onto a {} mesh",
            args.model_name,
            args.num_layers,
            provider.source_id(),
            mesh.shape()
        );
        let loader = Loader::<B, P> { mesh, provider };
        let attn = args.attention_dtype();
        let mlp = args.mlp_dtype();
        let act = args.weights_dtype;

        let embed_tokens = loader.table("model.embed_tokens.weight", act)?;

        let mut layers = Vec::with_capacity(args.num_layers);
        for i in 0..args.num_layers {
            let prefix = format!("model.layers.{i}");
            layers.push(LlamaLayerWeights {
                input_layernorm: loader.norm(&format!("{prefix}.input_layernorm.weight"), act)?,
                attention: LlamaAttentionWeights {
                    q_proj: loader.linear(&format!("{prefix}.self_attn.q_proj.weight"), attn, SPLIT_COLUMNS)?,
                    k_proj: loader.linear(&format!("{prefix}.self_attn.k_proj.weight"), attn, SPLIT_COLUMNS)?,
                    v_proj: loader.linear(&format!("{prefix}.self_attn.v_proj.weight"), attn, SPLIT_COLUMNS)?,
                    o_proj: loader.linear(&format!("{prefix}.self_attn.o_proj.weight"), attn, SPLIT_ROWS)?,
                },
                post_attention_layernorm: loader
                    .norm(&format!("{prefix}.post_attention_layernorm.weight"), act)?,
                mlp: LlamaMlpWeights {
                    gate_proj: loader.linear(&format!("{prefix}.mlp.gate_proj.weight"), mlp, SPLIT_COLUMNS)?,
                    up_proj: loader.linear(&format!("{prefix}.mlp.up_proj.weight"), mlp, SPLIT_COLUMNS)?,
                    down_proj: loader.linear(&format!("{prefix}.mlp.down_proj.weight"), mlp, SPLIT_ROWS)?,
                },
            });
        }

        let norm = loader.norm("model.norm.weight", act)?;

        // Tied checkpoints ship no lm_head
        let head_name = if provider.contains("lm_head.weight") {
            "lm_head.weight"
        } else {
            "model.embed_tokens.weight"
        };
        let lm_head = loader.linear(head_name, attn, SPLIT_COLUMNS)?;

        let attention_matmul = MatmulConfig {
            fidelity: MathFidelity::HiFi2,
            ..MatmulConfig::default()
        };
        let mlp_matmul = MatmulConfig {
            fidelity: args.mlp_fidelity(),
            ..MatmulConfig::default()
        };
        let head_matmul = MatmulConfig {
            output_dtype: Some(DType::F32),
            ..attention_matmul
        };

        Ok(Self {
            args,
            mesh: mesh.clone(),
            ccl: CollectiveSetup::sync(Topology::Linear),
            embed_tokens,
            layers,
            norm,
            lm_head,
            attention_matmul,
            mlp_matmul,
            head_matmul,
        })
    }

    /// Route every collective through `ccl` (async semaphore, CCL sub-device).
    #[must_use]
    pub fn with_collectives(mut self, ccl: CollectiveSetup<SemaphoreOf<B>>) -> Self {
        self.ccl = ccl;
        self
    }

    fn num_devices(&self) -> usize {
        self.mesh.shape().num_devices()
    }

    /// Combine row-parallel partial sums.
    fn reduce(&self, partial: B::Tensor) -> Result<B::Tensor> {
        if self.num_devices() == 1 {
            return Ok(partial);
        }
        B::all_reduce(&partial, self.ccl.params())
    }

    /// Output projection plus residual.
    fn attention_out(&self, x: &B::Tensor, attn: &B::Tensor, weights: &LlamaAttentionWeights<B::Tensor>) -> Result<B::Tensor> {
        let out = self.reduce(B::linear(attn, &weights.o_proj, &self.attention_matmul)?)?;
        B::add(x, &out)
    }

    /// `x + w2(silu(w1(norm(x))) * w3(norm(x)))`
    fn mlp(&self, x: &B::Tensor, layer: &LlamaLayerWeights<B::Tensor>) -> Result<B::Tensor> {
        let h = B::rms_norm(x, &layer.post_attention_layernorm, self.args.norm_eps)?;
        let gate_cfg = MatmulConfig {
            activation: Some(Activation::Silu),
            ..self.mlp_matmul
        };
        let gate = B::linear(&h, &layer.mlp.gate_proj, &gate_cfg)?;
        let up = B::linear(&h, &layer.mlp.up_proj, &self.mlp_matmul)?;
        let hidden = B::mul(&gate, &up)?;
        let down = self.reduce(B::linear(&hidden, &layer.mlp.down_proj, &self.mlp_matmul)?)?;
        B::add(x, &down)
    }

    /// `[1, 1, S, heads * hd]` → `[1, heads, S, hd]`
    fn split_heads_prefill(&self, t: &B::Tensor, heads: usize) -> Result<B::Tensor> {
        let seq_len = t.shape()[2];
        let t = B::reshape(t, &[1, seq_len, heads, self.args.head_dim])?;
        B::permute(&t, &[0, 2, 1, 3])
    }

    #[allow(clippy::too_many_arguments)]
    fn prefill_layer(
        &self,
        x: &B::Tensor,
        layer: &LlamaLayerWeights<B::Tensor>,
        rot: &RotationInputs<'_, B::Tensor>,
        user_id: usize,
        page_table: Option<&B::Tensor>,
        cache: &LayerKvCache<B::Tensor>,
    ) -> Result<B::Tensor> {
        let args = &self.args;
        let seq_len = x.shape()[2];
        let w = &layer.attention;
        let h = B::rms_norm(x, &layer.input_layernorm, args.norm_eps)?;

        let q = B::linear(&h, &w.q_proj, &self.attention_matmul)?;
        let k = B::linear(&h, &w.k_proj, &self.attention_matmul)?;
        let v = B::linear(&h, &w.v_proj, &self.attention_matmul)?;
        let q = self.split_heads_prefill(&q, args.n_heads)?;
        let k = self.split_heads_prefill(&k, args.n_kv_heads)?;
        let v = self.split_heads_prefill(&v, args.n_kv_heads)?;

        let q = B::rotary_embedding(&q, rot.cos, rot.sin, rot.trans_mat)?;
        let k = B::rotary_embedding(&k, rot.cos, rot.sin, rot.trans_mat)?;

        B::fill_cache(&cache.k, &k, user_id, page_table)?;
        B::fill_cache(&cache.v, &v, user_id, page_table)?;

        let attn = B::sdpa_prefill(&q, &k, &v, args.attention_scale())?;
        let attn = B::permute(&attn, &[0, 2, 1, 3])?;
        let attn = B::reshape(&attn, &[1, 1, seq_len, args.n_heads * args.head_dim])?;

        let x = self.attention_out(x, &attn, w)?;
        self.mlp(&x, layer)
    }

    fn decode_layer(
        &self,
        x: &B::Tensor,
        layer: &LlamaLayerWeights<B::Tensor>,
        cur_pos: &B::Tensor,
        rot: &RotationInputs<'_, B::Tensor>,
        page_table: Option<&B::Tensor>,
        cache: &LayerKvCache<B::Tensor>,
    ) -> Result<B::Tensor> {
        let args = &self.args;
        let batch = x.shape()[2];
        let hd = args.head_dim;
        let w = &layer.attention;
        let h = B::rms_norm(x, &layer.input_layernorm, args.norm_eps)?;

        let q = B::linear(&h, &w.q_proj, &self.attention_matmul)?;
        let k = B::linear(&h, &w.k_proj, &self.attention_matmul)?;
        let v = B::linear(&h, &w.v_proj, &self.attention_matmul)?;
        let q = B::reshape(&q, &[1, batch, args.n_heads, hd])?;
        let k = B::reshape(&k, &[1, batch, args.n_kv_heads, hd])?;
        let v = B::reshape(&v, &[1, batch, args.n_kv_heads, hd])?;

        let q = B::rotary_embedding(&q, rot.cos, rot.sin, rot.trans_mat)?;
        let k = B::rotary_embedding(&k, rot.cos, rot.sin, rot.trans_mat)?;

        B::update_cache(&cache.k, &k, cur_pos, page_table)?;
        B::update_cache(&cache.v, &v, cur_pos, page_table)?;

        let attn = B::sdpa_decode(&q, &cache.k, &cache.v, cur_pos, page_table, args.attention_scale())?;
        let attn = B::reshape(&attn, &[1, 1, batch, args.n_heads * hd])?;

        let x = self.attention_out(x, &attn, w)?;
        self.mlp(&x, layer)
    }

    fn check_cache(&self, kv_cache: &[LayerKvCache<B::Tensor>]) -> Result<()> {
        if kv_cache.len() != self.layers.len() {
            return Err(Error::config(format!(
                "model has {} layers but {} KV caches were supplied",
                self.layers.len(),
                kv_cache.len()
            )));
        }
        Ok(())
    }
}

impl<B: KernelRuntime> Model for LlamaModel<B> {
    type B = B;

    fn args(&self) -> &ModelArgs {
        &self.args
    }

    fn mesh(&self) -> &<B as Backend>::Mesh {
        &self.mesh
    }

    fn embed(&self, tokens: &TensorOf<Self>) -> Result<TensorOf<Self>> {
        B::embedding(tokens, &self.embed_tokens, Layout::Tile)
    }

    fn prefill_forward(
        &self,
        x: &TensorOf<Self>,
        rot: &RotationInputs<'_, TensorOf<Self>>,
        user_id: usize,
        page_table: Option<&TensorOf<Self>>,
        kv_cache: &[LayerKvCache<TensorOf<Self>>],
        get_last_token: usize,
    ) -> Result<TensorOf<Self>> {
        self.check_cache(kv_cache)?;
        let seq_len = x.shape()[2];
        if get_last_token % LAST_TOKEN_TILE != 0 || get_last_token + LAST_TOKEN_TILE > seq_len {
            return Err(Error::config(format!(
                "get_last_token {get_last_token} is not a tile row inside a {seq_len}-token prefill"
            )));
        }
        let mut hidden = x.clone();
        for (layer, cache) in self.layers.iter().zip(kv_cache) {
            hidden = self.prefill_layer(&hidden, layer, rot, user_id, page_table, cache)?;
        }
        let last = B::slice(&hidden, 2, get_last_token, get_last_token + LAST_TOKEN_TILE)?;
        let last = B::rms_norm(&last, &self.norm, self.args.norm_eps)?;
        B::linear(&last, &self.lm_head, &self.head_matmul)
    }

    fn decode_forward(
        &self,
        x: &TensorOf<Self>,
        cur_pos: &TensorOf<Self>,
        rot: &RotationInputs<'_, TensorOf<Self>>,
        page_table: Option<&TensorOf<Self>>,
        kv_cache: &[LayerKvCache<TensorOf<Self>>],
    ) -> Result<TensorOf<Self>> {
        self.check_cache(kv_cache)?;
        let mut hidden = x.clone();
        for (layer, cache) in self.layers.iter().zip(kv_cache) {
            hidden = self.decode_layer(&hidden, layer, cur_pos, rot, page_table, cache)?;
        }
        let hidden = B::rms_norm(&hidden, &self.norm, self.args.norm_eps)?;
        B::linear(&hidden, &self.lm_head, &self.head_matmul)
    }
}
