//! Shared command-line plumbing for the meshinfer example binaries.

use std::path::PathBuf;

use clap::Args;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use meshinfer::{
    ByteTokenizer, Error, HfTokenizer, MeshControl, ModelArgs, Optimizations, PageParams, Result,
    SamplingParams, Tokenizer,
};
use meshinfer_llama::{synthetic_weights, LlamaModel};
use meshinfer_runtime::{GeneratorConfig, Orchestrator, OrchestratorOptions};
use meshinfer_sim::{MeshConfig, SimBackend, SimMesh};

/// Options shared by every example.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// HF model directory (config.json, safetensors, tokenizer.json). A
    /// seeded tiny Llama and a byte tokenizer are used when omitted.
    #[arg(short, long, env = "MESHINFER_MODEL_PATH")]
    pub model: Option<PathBuf>,

    /// Mesh shape as ROWSxCOLS
    #[arg(long, default_value = "1x1", value_parser = parse_grid)]
    pub mesh: (usize, usize),

    /// Users per batch
    #[arg(short, long, default_value_t = 1)]
    pub batch_size: usize,

    /// KV slot length per user
    #[arg(long, default_value_t = 1024)]
    pub max_seq_len: usize,

    /// Tokens generated per user, counting the prefill token
    #[arg(short = 'n', long, default_value_t = 200)]
    pub max_generated_tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value_t = 0.0)]
    pub temperature: f32,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long, default_value_t = 0.08)]
    pub top_p: f32,

    /// RNG seed for sampling
    #[arg(short, long, default_value_t = 42)]
    pub seed: u64,

    /// Use a contiguous KV cache instead of the paged one
    #[arg(long)]
    pub no_paged_attention: bool,

    /// Tokens per KV page
    #[arg(long, default_value_t = 32)]
    pub page_block_size: usize,

    /// Pages in the pool; defaults to exactly what the batch needs
    #[arg(long)]
    pub page_max_num_blocks: Option<usize>,

    /// Command queues to use (1 or 2)
    #[arg(long, default_value_t = 2)]
    pub num_command_queues: usize,

    /// Use 8-bit MLP weights and HiFi2 matmuls
    #[arg(long)]
    pub accuracy: bool,

    /// Run collectives synchronously without a CCL sub-device
    #[arg(long)]
    pub sync_collectives: bool,

    /// JSON file with GeneratorConfig fields; command-line flags win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Raise the log level once per occurrence
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_grid(s: &str) -> std::result::Result<(usize, usize), String> {
    let (rows, cols) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected ROWSxCOLS, got {s:?}"))?;
    let rows = rows.trim().parse().map_err(|e| format!("bad row count: {e}"))?;
    let cols = cols.trim().parse().map_err(|e| format!("bad column count: {e}"))?;
    Ok((rows, cols))
}

impl CommonArgs {
    /// Install the global logger.
    ///
    /// # Errors
    /// Returns an error if a logger is already installed.
    pub fn init_log(&self) -> Result<()> {
        let base = match self.log_level.to_lowercase().as_str() {
            "off" | "none" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "debug" => LevelFilter::Debug,
            "trace" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };
        let level = (0..self.verbose).fold(base, |level, _| match level {
            LevelFilter::Off => LevelFilter::Error,
            LevelFilter::Error => LevelFilter::Warn,
            LevelFilter::Warn => LevelFilter::Info,
            LevelFilter::Info => LevelFilter::Debug,
            LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Trace,
        });
        SimpleLogger::new()
            .with_level(level)
            .init()
            .map_err(|e| Error::Other(format!("failed to install logger: {e}")))
    }

    pub fn optimizations(&self) -> Optimizations {
        if self.accuracy {
            Optimizations::Accuracy
        } else {
            Optimizations::Performance
        }
    }

    /// Generator options from the JSON file, if any, overridden by flags.
    ///
    /// # Errors
    /// Returns an error if the config file cannot be read.
    pub fn generator_config(&self) -> Result<GeneratorConfig> {
        let base = match &self.config {
            Some(path) => GeneratorConfig::from_file(path)?,
            None => GeneratorConfig::default(),
        };
        let blocks = self.page_max_num_blocks.unwrap_or_else(|| {
            (self.batch_size * self.max_seq_len).div_ceil(self.page_block_size).next_multiple_of(self.batch_size)
        });
        Ok(GeneratorConfig {
            batch_size: self.batch_size,
            max_seq_len: self.max_seq_len,
            max_generated_tokens: self.max_generated_tokens,
            paged_attention: !self.no_paged_attention,
            page_params: PageParams {
                page_block_size: self.page_block_size,
                page_max_num_blocks: blocks,
            },
            sampling: SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                seed: self.seed,
            },
            num_command_queues: self.num_command_queues,
            ..base
        })
    }

    /// Open the simulated mesh and bring up sub-devices and the fabric.
    ///
    /// # Errors
    /// Returns the mesh or orchestrator error.
    pub fn open_mesh(&self) -> Result<Orchestrator<SimMesh>> {
        let (rows, cols) = self.mesh;
        let mesh = SimMesh::open(MeshConfig {
            num_command_queues: self.num_command_queues,
            ..MeshConfig::with_grid(rows, cols)
        })?;
        Orchestrator::new(
            mesh,
            OrchestratorOptions {
                async_collectives: !self.sync_collectives,
                ..OrchestratorOptions::default()
            },
        )
    }

    /// Load the model and tokenizer onto `orchestrator`'s mesh, with its
    /// collective settings.
    ///
    /// # Errors
    /// Returns a weight, tokenizer or configuration error.
    pub fn load(&self, orchestrator: &Orchestrator<SimMesh>) -> Result<(LlamaModel<SimBackend>, Box<dyn Tokenizer>)> {
        let mesh = orchestrator.mesh();
        let (model, tokenizer): (LlamaModel<SimBackend>, Box<dyn Tokenizer>) = match &self.model {
            Some(path) => (
                LlamaModel::from_pretrained(mesh, path, self.batch_size, self.max_seq_len, self.optimizations())?,
                Box::new(HfTokenizer::from_pretrained(path)?) as Box<dyn Tokenizer>,
            ),
            None => {
                let args = demo_args(self.batch_size, self.max_seq_len, self.optimizations());
                let weights = synthetic_weights(&args, self.seed);
                (LlamaModel::load(mesh, args, &weights)?, Box::new(ByteTokenizer) as Box<dyn Tokenizer>)
            }
        };
        log::info!("Loaded model onto {} mesh", mesh.shape());
        Ok((model.with_collectives(orchestrator.collectives()), tokenizer))
    }
}

/// A small Llama that fits the byte tokenizer's vocabulary.
pub fn demo_args(max_batch_size: usize, max_seq_len: usize, optimizations: Optimizations) -> ModelArgs {
    ModelArgs {
        model_name: "tiny".into(),
        num_layers: 4,
        dim: 256,
        n_heads: 8,
        n_kv_heads: 2,
        head_dim: 32,
        hidden_dim: 768,
        vocab_size: ByteTokenizer::VOCAB_SIZE,
        max_seq_len,
        max_batch_size,
        optimizations,
        ..ModelArgs::llama_3_2_1b(max_batch_size, max_seq_len)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_model_path_from_env() {
        std::env::set_var("MESHINFER_MODEL_PATH", "/models/llama-3.2-1b");
        let cli = Cli::try_parse_from(["generate", "--mesh", "1x2"]).unwrap();
        std::env::remove_var("MESHINFER_MODEL_PATH");
        assert_eq!(cli.common.model, Some(PathBuf::from("/models/llama-3.2-1b")));
        assert_eq!(cli.common.mesh, (1, 2));
        assert_eq!(cli.common.batch_size, 1);
    }

    #[test]
    fn test_parse_grid() {
        assert_eq!(parse_grid("2x4"), Ok((2, 4)));
        assert_eq!(parse_grid("1X8"), Ok((1, 8)));
        assert!(parse_grid("8").is_err());
        assert!(parse_grid("ax2").is_err());
    }
}
