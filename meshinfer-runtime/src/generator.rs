//! The generation facade: prefill, trace capture, the decode pipeline and
//! perf reporting tied together over one model.

use std::time::Instant;

use meshinfer::model::{Model, TensorOf};
use meshinfer::{
    CollectiveSetup, Error, HostLogits, MeshControl, Profiler, QueueId, Result, SemaphoreOf,
    Topology, TensorIo, Tokenizer,
};

use crate::config::GeneratorConfig;
use crate::decode::{DecodePipeline, DecodeRecord, UserOutputs};
use crate::kv_cache::KvCacheManager;
use crate::perf::{device_name, write_iteration_log, PerfReport, PerfTargets, RunCounts};
use crate::prefill::{encode_prompts, PrefillScheduler};
use crate::rope_index::RopeIndex;
use crate::sampler::Sampler;
use crate::trace_builder::{DecodeInputs, DecodeTrace, TraceBuilder};

/// Result of [`Generator::generate`].
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt followed by the generated tokens, per user, of the last
    /// repeat-batch.
    pub tokens: Vec<Vec<u32>>,
    pub prompt_lens: Vec<usize>,
    /// One report per repeat-batch.
    pub reports: Vec<PerfReport>,
    /// Decode iterations of every repeat-batch, in order.
    pub records: Vec<Vec<DecodeRecord>>,
}

impl GenerationOutput {
    /// Generated tokens of `user`, without the prompt.
    #[must_use]
    pub fn completion(&self, user: usize) -> &[u32] {
        &self.tokens[user][self.prompt_lens[user]..]
    }
}

/// What one [`Generator::decode_forward_text`] call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutput {
    Logits(HostLogits),
    Tokens(Vec<u32>),
}

/// Owns a model and the engine state around it: KV cache, RoPE tables,
/// sampler, profiler and at most one cached decode trace.
pub struct Generator<M: Model> {
    model: M,
    config: GeneratorConfig,
    kv: KvCacheManager<M::B>,
    rope: RopeIndex<M::B>,
    ccl: CollectiveSetup<SemaphoreOf<M::B>>,
    sampler: Sampler,
    profiler: Profiler,
    targets: PerfTargets,
    batches_run: usize,
    trace: Option<DecodeTrace<TensorOf<M>>>,
}

impl<M: Model> Generator<M> {
    /// Validate `config` against the model, turn on the program cache and
    /// allocate the KV cache and RoPE tables.
    ///
    /// # Errors
    /// Returns a configuration error for inconsistent options, or
    /// `OutOfMemory` if the cache does not fit.
    pub fn new(model: M, config: GeneratorConfig) -> Result<Self> {
        config.validate(model.args())?;
        let mesh = model.mesh();
        mesh.enable_program_cache();
        let paging = config
            .paged_attention
            .then_some((&config.page_params, config.page_table_seed));
        let kv = KvCacheManager::new(mesh, model.args(), config.batch_size, config.max_seq_len, paging)?;
        let rope = RopeIndex::new(mesh, model.args())?;
        let sampler = Sampler::new(config.sampling, config.batch_size, config.argmax_on_device());
        log::info!(
            "Generator for {} on {}: batch {}, max_seq_len {}, {} sampling",
            model.args().model_name,
            mesh.shape(),
            config.batch_size,
            config.max_seq_len,
            if sampler.on_device() { "device argmax" } else { "host" }
        );
        Ok(Self {
            model,
            config,
            kv,
            rope,
            ccl: CollectiveSetup::sync(Topology::Linear),
            sampler,
            profiler: Profiler::new(),
            targets: PerfTargets::default(),
            batches_run: 0,
            trace: None,
        })
    }

    /// Collective settings for the vocab gather in the decode trace.
    #[must_use]
    pub fn with_collectives(mut self, ccl: CollectiveSetup<SemaphoreOf<M::B>>) -> Self {
        self.ccl = ccl;
        self
    }

    #[must_use]
    pub fn with_targets(mut self, targets: PerfTargets) -> Self {
        self.targets = targets;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn kv_cache(&self) -> &KvCacheManager<M::B> {
        &self.kv
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Decode iterations a batch with these prompt lengths can run: the
    /// token budget left after prefill, capped by the room in the KV slot.
    #[must_use]
    pub fn decode_iterations(&self, prompt_lens: &[usize]) -> usize {
        let budget = self.config.max_generated_tokens - 1;
        let longest = prompt_lens.iter().copied().max().unwrap_or(0);
        let room = self.config.max_seq_len.saturating_sub(longest);
        if room < budget {
            log::warn!(
                "Decode clamped to {room} iterations: longest prompt {longest} leaves no room for {budget} in max_seq_len {}",
                self.config.max_seq_len
            );
        }
        budget.min(room)
    }

    /// Serve `prompts`, one per batch slot, `repeat_batches` times.
    ///
    /// Every repeat-batch starts from a zeroed cache and re-seeded sampler
    /// streams, so all of them produce the same tokens.
    ///
    /// # Errors
    /// Returns a configuration error for a prompt count other than
    /// `batch_size` or an unusable prompt, or the first device error.
    pub fn generate(&mut self, prompts: &[Vec<u32>]) -> Result<GenerationOutput> {
        if prompts.len() != self.config.batch_size {
            return Err(Error::config(format!(
                "{} prompts for a batch of {}",
                prompts.len(),
                self.config.batch_size
            )));
        }
        self.release_trace()?;
        let mut output = GenerationOutput {
            tokens: Vec::new(),
            prompt_lens: prompts.iter().map(Vec::len).collect(),
            reports: Vec::with_capacity(self.config.repeat_batches),
            records: Vec::with_capacity(self.config.repeat_batches),
        };
        for batch in 0..self.config.repeat_batches {
            log::info!("Starting repeat-batch {batch}");
            let (tokens, records, report) = self.run_batch(prompts)?;
            output.tokens = tokens;
            output.records.push(records);
            output.reports.push(report);
        }
        if let Some(path) = &self.config.iteration_log {
            let all: Vec<DecodeRecord> = output.records.iter().flatten().cloned().collect();
            write_iteration_log(path, &all)?;
        }
        Ok(output)
    }

    fn run_batch(&mut self, prompts: &[Vec<u32>]) -> Result<(Vec<Vec<u32>>, Vec<DecodeRecord>, PerfReport)> {
        let started = Instant::now();
        self.profiler.clear();
        if self.batches_run > 0 {
            self.kv.zero_all()?;
        }
        self.sampler.reset();

        let prefill = PrefillScheduler::new(&self.model, &self.rope, &self.kv, self.config.pad_token_id)
            .run(prompts, self.config.max_seq_len, self.config.profile, &mut self.profiler)?;
        let first_tokens = if self.sampler.on_device() {
            prefill.first_tokens.clone()
        } else {
            self.sampler.sample(&prefill.logits)
        };
        let mut outputs = UserOutputs::new(prompts, self.config.eos_token_ids.clone());
        outputs.push_first(&first_tokens);

        let iterations = self.decode_iterations(&prefill.prompt_lens);
        let mut records = Vec::new();
        if iterations > 0 && !outputs.all_done() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let positions: Vec<i32> = prefill.prompt_lens.iter().map(|&p| p as i32).collect();
            let trace = TraceBuilder::new(&self.model, &self.rope, &self.kv, &self.ccl).capture(
                &first_tokens,
                &positions,
                self.sampler.on_device(),
            )?;
            let pipeline = DecodePipeline::<M::B>::new(
                self.model.mesh(),
                &trace,
                &self.rope,
                self.config.num_command_queues,
            )
            .with_position_check(self.config.check_positions);
            let ran = pipeline.run(
                &mut outputs,
                &prefill.prompt_lens,
                iterations,
                &mut self.sampler,
                &mut self.profiler,
            );
            self.model.mesh().release_trace(trace.id)?;
            records = ran?;
        }
        self.model.mesh().synchronize()?;
        self.batches_run += 1;

        let report = self.report(prompts, records.len(), started.elapsed().as_secs_f64())?;
        Ok((outputs.into_tokens(), records, report))
    }

    fn report(&self, prompts: &[Vec<u32>], decode_steps: usize, full_runtime: f64) -> Result<PerfReport> {
        let prefill_tokens = match prompts {
            [only] if self.config.profile => only.len(),
            [_] => 0,
            [_, rest @ ..] => rest.iter().map(Vec::len).sum(),
            [] => 0,
        };
        let device = self
            .config
            .device_name
            .clone()
            .unwrap_or_else(|| device_name(self.model.mesh().shape()));
        let report = PerfReport::new(
            &self.profiler,
            &device,
            &self.model.args().model_name,
            RunCounts {
                batch_size: prompts.len(),
                prefill_tokens,
                decode_iterations: decode_steps.saturating_sub(1),
            },
            full_runtime,
        );
        report.log();
        report.check_targets(&self.targets);
        if let Some(path) = &self.config.benchmark_csv {
            report.append_csv(path)?;
        }
        if let Some(path) = &self.config.perf_summary {
            report.write_json(path)?;
        }
        Ok(report)
    }

    /// Tokenize `prompts`, generate, and decode each user's completion.
    ///
    /// With no configured end-of-sequence ids the tokenizer's EOS is used,
    /// plus the end-of-turn token in instruct mode.
    ///
    /// # Errors
    /// Returns a tokenizer error or any error of [`Self::generate`].
    pub fn generate_text<T: Tokenizer + ?Sized, S: AsRef<str>>(
        &mut self,
        tokenizer: &T,
        prompts: &[S],
    ) -> Result<(Vec<String>, GenerationOutput)> {
        let encoded = encode_prompts(
            tokenizer,
            prompts,
            self.config.instruct,
            self.config.max_prefill_len.min(self.config.max_seq_len),
        )?;
        if self.config.eos_token_ids.is_empty() {
            let mut eos = vec![tokenizer.eos_token_id()];
            if self.config.instruct {
                eos.extend(tokenizer.special_token_id("<|eot_id|>"));
            }
            self.config.eos_token_ids = eos;
        }
        let output = self.generate(&encoded)?;
        let texts = (0..output.tokens.len())
            .map(|user| tokenizer.decode(output.completion(user)))
            .collect::<Result<Vec<_>>>()?;
        Ok((texts, output))
    }

    /// Prefill every user of `prompts` into the cache and return the logits
    /// of each user's last prompt token.
    ///
    /// # Errors
    /// Returns a configuration error for an unusable prompt, or the first
    /// device error.
    pub fn prefill_forward_text(&mut self, prompts: &[Vec<u32>]) -> Result<HostLogits> {
        let prefill = PrefillScheduler::new(&self.model, &self.rope, &self.kv, self.config.pad_token_id)
            .run(prompts, self.config.max_seq_len, self.config.profile, &mut self.profiler)?;
        Ok(prefill.logits)
    }

    /// Run one decode step for the whole batch at `cur_pos`.
    ///
    /// With `enable_trace` the first call captures a trace and later calls
    /// with the same batch size and argmax mode replay it on the same input
    /// tensors; a different mode releases it and captures a new one.
    ///
    /// The page table and KV cache are the generator's own; an external
    /// orchestrator shares them through this generator rather than passing
    /// its own.
    ///
    /// # Errors
    /// Returns a shape error if `tokens` and `cur_pos` differ in length, or
    /// the first device error.
    pub fn decode_forward_text(
        &mut self,
        tokens: &[u32],
        cur_pos: &[i32],
        enable_trace: bool,
        argmax_on_device: bool,
    ) -> Result<DecodeOutput> {
        if argmax_on_device && !self.config.sampling.is_greedy() {
            return Err(Error::config("argmax_on_device needs greedy sampling"));
        }
        let mesh = self.model.mesh().clone();
        let output = if enable_trace {
            let reusable = self.trace.as_ref().is_some_and(|t| {
                t.argmax_on_device == argmax_on_device && t.batch_size() == tokens.len()
            });
            if reusable {
                if let Some(trace) = &self.trace {
                    trace.inputs.reset::<M::B>(QueueId::COMPUTE, tokens, cur_pos)?;
                    mesh.execute_trace(QueueId::COMPUTE, trace.id, false)?;
                }
            } else {
                self.release_trace()?;
                let trace = TraceBuilder::new(&self.model, &self.rope, &self.kv, &self.ccl)
                    .capture(tokens, cur_pos, argmax_on_device)?;
                mesh.execute_trace(QueueId::COMPUTE, trace.id, false)?;
                self.trace = Some(trace);
            }
            match &self.trace {
                Some(trace) => trace.output.clone(),
                None => return Err(Error::Other("decode trace missing after capture".into())),
            }
        } else {
            let inputs = DecodeInputs::upload::<M::B>(&mesh, tokens, cur_pos)?;
            TraceBuilder::new(&self.model, &self.rope, &self.kv, &self.ccl)
                .decode_step(&inputs, argmax_on_device)?
        };
        mesh.synchronize()?;
        let data = <M::B as TensorIo>::to_host(&output)?;
        if argmax_on_device {
            Ok(DecodeOutput::Tokens(data.into_u32()?))
        } else {
            Ok(DecodeOutput::Logits(HostLogits::new(
                data.into_f32()?,
                self.model.args().vocab_size,
            )?))
        }
    }

    /// Release the cached decode trace, if any.
    ///
    /// # Errors
    /// Returns the mesh's error for an unknown trace.
    pub fn release_trace(&mut self) -> Result<()> {
        if let Some(trace) = self.trace.take() {
            self.model.mesh().release_trace(trace.id)?;
            log::debug!("Released decode trace {}", trace.id.0);
        }
        Ok(())
    }
}

impl<M: Model> Drop for Generator<M> {
    fn drop(&mut self) {
        if let Err(e) = self.release_trace() {
            log::warn!("Failed to release decode trace: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_skips_prompt() {
        let output = GenerationOutput {
            tokens: vec![vec![1, 2, 3, 4], vec![5, 6]],
            prompt_lens: vec![2, 1],
            reports: Vec::new(),
            records: Vec::new(),
        };
        assert_eq!(output.completion(0), &[3, 4]);
        assert_eq!(output.completion(1), &[6]);
    }
}
