//! meshinfer runtime: batched generation on an accelerator mesh
//!
//! The [`Generator`] drives one model through per-user prefill and a
//! traced, two-queue decode loop.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator<M>      ← mesh setup: sub-devices, fabric, semaphores
//! Generator<M>         ← prompts in, tokens out (owns Model + KV cache)
//!   ├── PrefillScheduler  ← one user at a time into the cache
//!   ├── TraceBuilder      ← captures one decode step
//!   ├── DecodePipeline    ← replays it on CQ0, reads back on CQ1
//!   ├── Sampler           ← device argmax or host top-p
//!   └── PerfReport        ← profiler spans to t/s, CSV and JSON
//! ```

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

mod config;
mod decode;
mod generator;
mod kv_cache;
mod orchestrator;
mod perf;
mod prefill;
mod rope_index;
mod sampler;
mod trace_builder;

pub use config::GeneratorConfig;
pub use decode::{transfer_queue, DecodePipeline, DecodeRecord, UserOutputs};
pub use generator::{DecodeOutput, GenerationOutput, Generator};
pub use kv_cache::{make_page_table, KvCacheManager, PagedTable};
pub use orchestrator::{Orchestrator, OrchestratorOptions, CCL_SUB_DEVICE, COMPUTE_SUB_DEVICE};
pub use perf::{device_name, write_iteration_log, PerfReport, PerfTarget, PerfTargets, RunCounts};
pub use prefill::{
    check_prompts, encode_prompts, last_token_offsets, prefill_seq_len, truncate_prompt,
    PrefillOutput, PrefillScheduler, LAST_TOKEN_TILE, MIN_PREFILL_LEN,
};
pub use rope_index::{table_len, RopeIndex, RotIdxs};
pub use sampler::{device_argmax, Sampler, SamplingMode};
pub use trace_builder::{DecodeInputs, DecodeTrace, TraceBuilder};
