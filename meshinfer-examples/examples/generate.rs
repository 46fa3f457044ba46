//! Batched text generation on a simulated mesh
//!
//! Usage:
//!   # Tiny seeded model, byte tokenizer, one user:
//!   cargo run --example generate -- "The capital of France is"
//!   # Real checkpoint, four users on a 1x2 mesh, chat template:
//!   cargo run --example generate -- -m models/llama-3.2-1b --mesh 1x2 -b 4 --instruct "Hi"
//!   # Prompts from a JSON list:
//!   cargo run --example generate -- --prompts-file prompts.json -b 8

use std::path::PathBuf;

use clap::Parser;

use meshinfer::{Error, Result};
use meshinfer_examples::CommonArgs;
use meshinfer_runtime::Generator;

/// Prefill every user, then decode them together through a captured trace.
///
/// With fewer prompts than `--batch-size` the prompts are repeated to fill
/// the batch.
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Prompts, one per user
    #[arg(default_value = "Hello")]
    prompts: Vec<String>,

    /// JSON file holding a list of prompt strings
    #[arg(long)]
    prompts_file: Option<PathBuf>,

    /// Wrap prompts in the Llama-3 chat template
    #[arg(long)]
    instruct: bool,

    /// Times to serve the same batch
    #[arg(long, default_value_t = 1)]
    repeat_batches: usize,
}

fn load_prompts(cli: &Cli) -> Result<Vec<String>> {
    let prompts: Vec<String> = match &cli.prompts_file {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => cli.prompts.clone(),
    };
    if prompts.is_empty() {
        return Err(Error::config("no prompts given"));
    }
    Ok((0..cli.common.batch_size)
        .map(|user| prompts[user % prompts.len()].clone())
        .collect())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_log()?;

    let mut orchestrator = cli.common.open_mesh()?;
    let (model, tokenizer) = cli.common.load(&orchestrator)?;
    let mut config = cli.common.generator_config()?;
    config.instruct = cli.instruct;
    config.repeat_batches = cli.repeat_batches;

    let prompts = load_prompts(&cli)?;
    let mut generator = Generator::new(model, config)?.with_collectives(orchestrator.collectives());
    let (texts, output) = generator.generate_text(tokenizer.as_ref(), &prompts)?;

    for (user, (prompt, text)) in prompts.iter().zip(&texts).enumerate() {
        println!("--- user {user} ({} tokens) ---", output.completion(user).len());
        println!("{prompt}{text}");
    }
    if let Some(report) = output.reports.last() {
        println!(
            "\nprefill {:.1} t/s, decode {:.2} t/s/u ({:.1} t/s), compile {:.2}s",
            report.prefill_t_s, report.decode_t_s_u, report.decode_t_s, report.total_compile
        );
    }

    drop(generator);
    orchestrator.teardown()
}
