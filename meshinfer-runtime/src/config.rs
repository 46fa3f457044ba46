//! Generation options recognized by the [`Generator`](crate::Generator).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use meshinfer::{Error, ModelArgs, PageParams, Result, SamplingParams, MAX_BATCH_SIZE};

/// Everything one `generate` call needs besides the model and the prompts.
///
/// Every field has a default, so a JSON file only has to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Users served per repeat-batch.
    pub batch_size: usize,
    /// Tokens each user's KV slot can hold. Must not exceed the model's.
    pub max_seq_len: usize,
    /// Tokens generated per user, counting the one produced by prefill.
    pub max_generated_tokens: usize,
    /// Prompts longer than this are truncated.
    pub max_prefill_len: usize,
    /// Wrap prompts in the chat template.
    pub instruct: bool,
    /// Route the KV cache through a shuffled page table.
    pub paged_attention: bool,
    pub page_params: PageParams,
    /// Seed of the page-table shuffle.
    pub page_table_seed: u64,
    pub sampling: SamplingParams,
    /// Times the same prompts are served back to back.
    pub repeat_batches: usize,
    /// 1 runs transfers on the compute queue; 2 overlaps them on CQ1.
    pub num_command_queues: usize,
    /// Token used to pad prompts to their prefill length.
    pub pad_token_id: u32,
    /// Tokens that end a user's generation. Empty means the tokenizer's EOS.
    pub eos_token_ids: Vec<u32>,
    /// Time a second prefill of user 0 when the batch has one user.
    pub profile: bool,
    /// Force (`Some(true)`) or forbid (`Some(false)`) argmax inside the
    /// trace. `None` picks it for a single greedy user.
    pub argmax_on_device: Option<bool>,
    /// Read the device position and rotation index back every iteration and
    /// fail on drift.
    pub check_positions: bool,
    /// Device label used to look up perf targets. Defaults to the mesh shape.
    pub device_name: Option<String>,
    /// Where to append the benchmark CSV row.
    pub benchmark_csv: Option<PathBuf>,
    /// Where to write the JSON perf summary.
    pub perf_summary: Option<PathBuf>,
    /// Where to write per-iteration decode timings.
    pub iteration_log: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_seq_len: 1024,
            max_generated_tokens: 200,
            max_prefill_len: 128 * 1024,
            instruct: false,
            paged_attention: true,
            page_params: PageParams::default(),
            page_table_seed: 0,
            sampling: SamplingParams::default(),
            repeat_batches: 1,
            num_command_queues: 2,
            pad_token_id: 0,
            eos_token_ids: Vec::new(),
            profile: false,
            argmax_on_device: None,
            check_positions: false,
            device_name: None,
            benchmark_csv: None,
            perf_summary: None,
            iteration_log: None,
        }
    }
}

impl GeneratorConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Whether the decode trace ends in an on-device argmax.
    #[must_use]
    pub fn argmax_on_device(&self) -> bool {
        self.argmax_on_device
            .unwrap_or(self.batch_size == 1 && self.sampling.is_greedy())
    }

    /// Check the options against each other and against `args`.
    ///
    /// # Errors
    /// Returns a configuration error citing the offending value.
    pub fn validate(&self, args: &ModelArgs) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::config(format!(
                "batch_size {} outside 1..={MAX_BATCH_SIZE}",
                self.batch_size
            )));
        }
        if self.batch_size > args.max_batch_size {
            return Err(Error::config(format!(
                "batch_size {} exceeds the model's max_batch_size {}",
                self.batch_size, args.max_batch_size
            )));
        }
        if self.max_seq_len == 0 || self.max_seq_len > args.max_seq_len {
            return Err(Error::config(format!(
                "max_seq_len {} outside 1..={} supported by the model",
                self.max_seq_len, args.max_seq_len
            )));
        }
        if self.max_generated_tokens == 0 {
            return Err(Error::config("max_generated_tokens must be at least 1"));
        }
        if self.max_prefill_len == 0 {
            return Err(Error::config("max_prefill_len must be at least 1"));
        }
        if self.repeat_batches == 0 {
            return Err(Error::config("repeat_batches must be at least 1"));
        }
        if !(1..=2).contains(&self.num_command_queues) {
            return Err(Error::config(format!(
                "num_command_queues must be 1 or 2, got {}",
                self.num_command_queues
            )));
        }
        if self.pad_token_id as usize >= args.vocab_size {
            return Err(Error::config(format!(
                "pad_token_id {} outside vocab of {}",
                self.pad_token_id, args.vocab_size
            )));
        }
        self.sampling.validate()?;
        if self.argmax_on_device == Some(true) && !self.sampling.is_greedy() {
            return Err(Error::config(format!(
                "argmax_on_device needs temperature 0, got {}",
                self.sampling.temperature
            )));
        }
        if self.paged_attention {
            let pages = &self.page_params;
            let capacity = pages.page_block_size * pages.page_max_num_blocks;
            let needed = self.batch_size * self.max_seq_len;
            if capacity < needed {
                return Err(Error::config(format!(
                    "page pool of {} blocks x {} tokens holds {capacity} tokens, \
                     batch {} x max_seq_len {} needs {needed}",
                    pages.page_max_num_blocks,
                    pages.page_block_size,
                    self.batch_size,
                    self.max_seq_len
                )));
            }
        }
        Ok(())
    }
}
