//! Shared helpers for generation tests.
//!
//! Builds a tiny f32 Llama with seeded weights on a simulated mesh, plus
//! byte-tokenized prompts of different lengths.
//!
//! With a head tied to the embedding, the input token's own logit dominates
//! and greedy decode repeats it forever. The test model instead gets an
//! untied head whose row `t` is embedding row `t - 1`, so each step mostly
//! emits the successor of its input and the token stream moves.

#![allow(dead_code)]

use meshinfer::{
    ByteTokenizer, DType, HostTensor, ModelArgs, Optimizations, PageParams, Result, SamplingParams,
    SyntheticWeights, Tokenizer, WeightProvider,
};
use meshinfer_llama::{synthetic_weights, LlamaModel};
use meshinfer_runtime::GeneratorConfig;
use meshinfer_sim::{MeshConfig, SimBackend, SimMesh};

pub type Llama = LlamaModel<SimBackend>;

/// KV slot length of every test model.
pub const MAX_SEQ_LEN: usize = 256;

pub fn tiny_args(max_batch_size: usize) -> ModelArgs {
    ModelArgs {
        model_name: "tiny".into(),
        num_layers: 2,
        dim: 64,
        n_heads: 4,
        n_kv_heads: 2,
        head_dim: 16,
        hidden_dim: 128,
        vocab_size: ByteTokenizer::VOCAB_SIZE,
        max_seq_len: MAX_SEQ_LEN,
        max_batch_size,
        norm_eps: 1e-5,
        rope_theta: 10_000.0,
        use_scaled_rope: false,
        rope_scaling: None,
        optimizations: Optimizations::Accuracy,
        kv_cache_dtype: DType::F32,
        weights_dtype: DType::F32,
    }
}

/// A `rows x cols` mesh with the command log switched on.
pub fn open_mesh(rows: usize, cols: usize) -> SimMesh {
    SimMesh::open(MeshConfig {
        record_log: true,
        ..MeshConfig::with_grid(rows, cols)
    })
    .expect("Failed to open simulated mesh")
}

/// Seeded weights plus an `lm_head` that maps token `t` to `t + 1`.
pub struct SuccessorHead {
    inner: SyntheticWeights,
}

impl SuccessorHead {
    const HEAD: &'static str = "lm_head.weight";
    const EMBED: &'static str = "model.embed_tokens.weight";

    pub fn new(args: &ModelArgs, seed: u64) -> Self {
        Self {
            inner: synthetic_weights(args, seed),
        }
    }
}

impl WeightProvider for SuccessorHead {
    fn tensor(&self, name: &str) -> Result<HostTensor> {
        if name != Self::HEAD {
            return self.inner.tensor(name);
        }
        let embed = self.inner.tensor(Self::EMBED)?;
        let [vocab, dim] = embed.shape[..] else {
            return Ok(embed);
        };
        let data = (0..vocab)
            .flat_map(|t| {
                let src = (t + vocab - 1) % vocab;
                embed.data[src * dim..(src + 1) * dim].iter().copied()
            })
            .collect();
        HostTensor::new(vec![vocab, dim], data)
    }

    fn contains(&self, name: &str) -> bool {
        name == Self::HEAD || self.inner.contains(name)
    }

    fn source_id(&self) -> String {
        format!("{}-successor", self.inner.source_id())
    }
}

pub fn tiny_model(mesh: &SimMesh, max_batch_size: usize) -> Llama {
    let args = tiny_args(max_batch_size);
    let weights = SuccessorHead::new(&args, 1234);
    Llama::load(mesh, args, &weights).expect("Failed to load tiny model")
}

/// Greedy, paged, two-queue generation of `max_generated_tokens`.
pub fn greedy_config(batch_size: usize, max_generated_tokens: usize) -> GeneratorConfig {
    GeneratorConfig {
        batch_size,
        max_seq_len: MAX_SEQ_LEN,
        max_generated_tokens,
        paged_attention: true,
        page_params: PageParams {
            page_block_size: 32,
            page_max_num_blocks: batch_size * MAX_SEQ_LEN / 32,
        },
        sampling: SamplingParams::greedy(),
        ..GeneratorConfig::default()
    }
}

/// Prompts of different lengths so users sit at different positions.
pub fn prompts(batch_size: usize) -> Vec<Vec<u32>> {
    const TEXTS: [&str; 4] = [
        "The capital of France is",
        "Once upon a time",
        "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,",
        "def fibonacci(n):",
    ];
    let tokenizer = ByteTokenizer;
    (0..batch_size)
        .map(|user| {
            tokenizer
                .encode(TEXTS[user % TEXTS.len()], true, false)
                .expect("Byte tokenizer never fails")
        })
        .collect()
}
