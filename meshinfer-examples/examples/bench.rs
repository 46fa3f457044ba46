//! Decode throughput benchmark
//!
//! Runs fixed-length synthetic prompts through the full prefill + traced
//! decode path and reports the perf summary against the target table.
//!
//! Usage:
//!   cargo run --release --example bench -- -b 32 -n 128 --csv bench.csv
//!   cargo run --release --example bench -- --mesh 1x8 --targets targets.json

use std::path::PathBuf;

use clap::Parser;

use meshinfer::{Model, Result};
use meshinfer_examples::CommonArgs;
use meshinfer_runtime::{Generator, PerfTargets};

#[derive(Parser)]
#[command(name = "bench")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Prompt length in tokens
    #[arg(long, default_value_t = 128)]
    prompt_len: usize,

    /// Repeat-batches; reports after the first are warm
    #[arg(long, default_value_t = 2)]
    repeat_batches: usize,

    /// JSON list of {device, model, decode_t_s_u} overriding the defaults
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Device label for the target lookup
    #[arg(long)]
    device: Option<String>,

    /// Append the summary row to this CSV
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write the JSON summary here
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write per-iteration decode timings (JSON lines) here
    #[arg(long)]
    iteration_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_log()?;

    let mut orchestrator = cli.common.open_mesh()?;
    let (model, _tokenizer) = cli.common.load(&orchestrator)?;
    let vocab = u32::try_from(model.args().vocab_size).unwrap_or(u32::MAX);

    let mut config = cli.common.generator_config()?;
    config.repeat_batches = cli.repeat_batches;
    config.device_name = cli.device.clone();
    config.benchmark_csv = cli.csv.clone();
    config.perf_summary = cli.json.clone();
    config.iteration_log = cli.iteration_log.clone();
    // Keep every user decoding for the whole run
    config.eos_token_ids = Vec::new();

    let targets = match &cli.targets {
        Some(path) => PerfTargets::from_file(path)?,
        None => PerfTargets::default(),
    };

    // Distinct, always-valid token ids per user
    let prompts: Vec<Vec<u32>> = (0..config.batch_size)
        .map(|user| {
            (0..cli.prompt_len)
                .map(|i| u32::try_from(user * 7 + i * 13 + 3).unwrap_or(0) % vocab)
                .collect()
        })
        .collect();

    let mut generator = Generator::new(model, config)?
        .with_collectives(orchestrator.collectives())
        .with_targets(targets);
    let output = generator.generate(&prompts)?;

    for (batch, report) in output.reports.iter().enumerate() {
        println!(
            "batch {batch}: prefill {:.1} t/s, time-to-token {:.3}s, decode {:.2} t/s/u = {:.1} t/s over {} iterations",
            report.prefill_t_s,
            report.prefill_time_to_token,
            report.decode_t_s_u,
            report.decode_t_s,
            report.decode_iterations
        );
    }

    drop(generator);
    orchestrator.teardown()
}
