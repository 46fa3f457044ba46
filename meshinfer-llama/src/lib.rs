//! Llama model implementation for meshinfer

mod config;
mod model;
mod synthetic;

pub use config::LlamaConfig;
pub use model::LlamaModel;
pub use synthetic::synthetic_weights;
