//! meshinfer: batched LLM generation on a mesh of accelerator chips.
//!
//! This crate holds the pieces shared by every backend, model and the
//! generation engine: the Kernel Runtime traits, tensor placement
//! attributes, model hyper-parameters, host-side RoPE and sampling, the
//! page-table construction, weight providers, tokenizers and the profiler.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

pub mod backend;
pub mod chat_format;
pub mod dtype;
pub mod error;
pub mod host;
pub mod mesh;
pub mod model;
pub mod model_args;
pub mod page_table;
pub mod profiler;
pub mod rope;
pub mod sampling;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

pub use backend::{
    Activation, ArgmaxOps, ArithOps, AttentionOps, Backend, CollectiveOps, EmbedOps, EventOf,
    GlobalSemaphore, KernelRuntime, LayoutOps, MatmulConfig, MatmulOps, MathFidelity,
    MeshControl, NormOps, RopeOps, SemaphoreOf, TensorIo,
};
pub use chat_format::{ChatFormat, ChatMessage};
pub use dtype::DType;
pub use error::{Error, ErrorKind, Result};
pub use host::{HostBuffer, HostData};
pub use mesh::{
    CollectiveParams, CollectiveSetup, CoreCoord, CoreRange, CoreRangeSet, MeshShape, QueueId,
    SubDevice, SubDeviceId, SubDeviceManagerId, Topology, TraceId,
};
pub use model::{LayerKvCache, Model, RotationInputs, TensorOf};
pub use model_args::{ModelArgs, Optimizations, PageParams, MAX_BATCH_SIZE};
pub use page_table::PageTable;
pub use profiler::Profiler;
pub use rope::RopeScaling;
pub use sampling::{HostLogits, SamplingParams};
pub use tensor::{
    CoreGrid, Layout, MemoryConfig, MeshMapping, ShardSpec, ShardStrategy, Tensor, TensorSpec,
    TILE_HEIGHT, TILE_WIDTH,
};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
pub use weights::{CachedWeights, HostTensor, SafeTensorsProvider, SyntheticWeights, WeightProvider};
