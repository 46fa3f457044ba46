//! Two-queue decode loop around a captured trace.
//!
//! CQ0 replays the trace; CQ1 reads the result back and refreshes the
//! rotation index. Two events order them:
//!
//! - `op_event` is recorded on CQ0 after each replay. CQ1 waits on it
//!   before reading, so a readout never sees the previous step's token.
//! - `write_event` is recorded on CQ1 after the readout and the index
//!   upload. CQ0 waits on it before the next replay, so the next step
//!   never reads a stale index or token.
//!
//! With a single command queue the same commands run in order on CQ0 and
//! the events become no-ops.

use std::time::{Duration, Instant};

use serde::Serialize;

use meshinfer::{
    Error, EventOf, HostBuffer, HostData, HostLogits, KernelRuntime, MeshControl, Profiler,
    QueueId, Result, Tensor,
};

use crate::rope_index::RopeIndex;
use crate::sampler::Sampler;
use crate::trace_builder::DecodeTrace;

/// Per-user token buffers with end-of-sequence latching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOutputs {
    pub tokens: Vec<Vec<u32>>,
    pub done: Vec<bool>,
    eos_token_ids: Vec<u32>,
}

impl UserOutputs {
    /// Start every user's buffer with its prompt.
    #[must_use]
    pub fn new(prompts: &[Vec<u32>], eos_token_ids: Vec<u32>) -> Self {
        Self {
            tokens: prompts.to_vec(),
            done: vec![false; prompts.len()],
            eos_token_ids,
        }
    }

    /// Append the token chosen by prefill. It is kept even when it ends the
    /// user, so every buffer holds at least one generated token.
    pub fn push_first(&mut self, first_tokens: &[u32]) {
        for (user, &token) in first_tokens.iter().enumerate() {
            self.tokens[user].push(token);
            if self.eos_token_ids.contains(&token) {
                self.done[user] = true;
            }
        }
    }

    /// Apply one decode step: an end-of-sequence token latches the user as
    /// done and is dropped; users already done are left untouched.
    pub fn push_step(&mut self, step: &[u32]) {
        for (user, &token) in step.iter().enumerate() {
            if self.done[user] {
                continue;
            }
            if self.eos_token_ids.contains(&token) {
                self.done[user] = true;
            } else {
                self.tokens[user].push(token);
            }
        }
    }

    #[must_use]
    pub fn all_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    #[must_use]
    pub fn into_tokens(self) -> Vec<Vec<u32>> {
        self.tokens
    }
}

/// Timing and state of one decode iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeRecord {
    pub iteration: usize,
    /// Token each user produced, appended or not.
    pub tokens: Vec<u32>,
    /// Host positions after the step.
    pub positions: Vec<i32>,
    pub seconds: f64,
}

/// Queue to use for transfers on a mesh with `num_command_queues`.
#[must_use]
pub fn transfer_queue(num_command_queues: usize) -> QueueId {
    if num_command_queues >= 2 {
        QueueId::TRANSFER
    } else {
        QueueId::COMPUTE
    }
}

/// Replays a decode trace until every user is done or the budget runs out.
pub struct DecodePipeline<'a, B: KernelRuntime> {
    mesh: &'a B::Mesh,
    trace: &'a DecodeTrace<B::Tensor>,
    rope: &'a RopeIndex<B>,
    transfer: QueueId,
    op_event: EventOf<B>,
    write_event: EventOf<B>,
    check_positions: bool,
}

impl<'a, B: KernelRuntime> DecodePipeline<'a, B> {
    #[must_use]
    pub fn new(
        mesh: &'a B::Mesh,
        trace: &'a DecodeTrace<B::Tensor>,
        rope: &'a RopeIndex<B>,
        num_command_queues: usize,
    ) -> Self {
        Self {
            mesh,
            trace,
            rope,
            transfer: transfer_queue(num_command_queues.min(mesh.num_command_queues())),
            op_event: mesh.create_event(),
            write_event: mesh.create_event(),
            check_positions: false,
        }
    }

    /// Read the device position tensor and the freshly uploaded rotation
    /// index back every iteration and fail if either drifts from the host
    /// positions.
    #[must_use]
    pub fn with_position_check(mut self, check: bool) -> Self {
        self.check_positions = check;
        self
    }

    #[must_use]
    pub fn transfer(&self) -> QueueId {
        self.transfer
    }

    /// Run up to `iterations` steps starting with each user's next token at
    /// `start_pos`.
    ///
    /// The first replay is recorded as `compile_decode` and the rest are
    /// summed into `inference_decode`; each step is also recorded as
    /// `decode_iteration` tagged with its index.
    ///
    /// # Errors
    /// Returns the first queue or kernel error, or a device error if
    /// position checking is on and the device position or rotation index drifts.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn run(
        &self,
        outputs: &mut UserOutputs,
        start_pos: &[usize],
        iterations: usize,
        sampler: &mut Sampler,
        profiler: &mut Profiler,
    ) -> Result<Vec<DecodeRecord>> {
        let compute = QueueId::COMPUTE;
        let transfer = self.transfer;
        let inputs = &self.trace.inputs;
        let vocab = self.trace.output.shape().last().copied().unwrap_or(0);
        let readout = HostBuffer::new();
        let device_pos = HostBuffer::new();
        let device_rot = HostBuffer::new();
        let mut pos: Vec<i32> = start_pos.iter().map(|&p| p as i32).collect();
        let mut records = Vec::with_capacity(iterations);
        let mut inference_seconds = 0.0;

        for iteration in 0..iterations {
            let started = Instant::now();
            profiler.start("decode_iteration", Some(iteration));

            self.mesh.wait_for_event(compute, &self.write_event)?;
            self.mesh.execute_trace(compute, self.trace.id, false)?;
            self.mesh.record_event(compute, &self.op_event)?;

            for p in &mut pos {
                *p += 1;
            }
            let staged = self.rope.get_rot_idxs(&pos, true)?;

            self.mesh.wait_for_event(transfer, &self.op_event)?;
            B::read_async(transfer, &self.trace.output, &readout)?;
            if self.check_positions {
                B::read_async(transfer, &inputs.cur_pos, &device_pos)?;
            }
            B::copy_host_to_device(transfer, staged.into_host()?, &inputs.rot_idxs)?;
            if self.check_positions {
                B::read_async(transfer, &inputs.rot_idxs, &device_rot)?;
            }
            self.mesh.record_event(transfer, &self.write_event)?;
            self.mesh.event_synchronize(&self.write_event)?;

            let step = if self.trace.argmax_on_device {
                readout.take()?.into_u32()?
            } else {
                let logits = HostLogits::new(readout.take()?.into_f32()?, vocab)?;
                let step = sampler.sample(&logits);
                B::copy_host_to_device(transfer, HostData::U32(step.clone()), &inputs.tokens)?;
                self.mesh.record_event(transfer, &self.write_event)?;
                step
            };
            if self.check_positions {
                let on_device = device_pos.take()?.into_i32()?;
                if on_device != pos {
                    return Err(Error::Device(format!(
                        "decode iteration {iteration}: device positions {on_device:?} drifted from host {pos:?}"
                    )));
                }
                let rot = device_rot.take()?.into_i32()?;
                if rot != pos {
                    return Err(Error::Device(format!(
                        "decode iteration {iteration}: rotation index {rot:?} staged for host positions {pos:?}"
                    )));
                }
            }
            outputs.push_step(&step);

            profiler.end("decode_iteration", Some(iteration));
            let seconds = started.elapsed().as_secs_f64();
            if iteration == 0 {
                profiler.record("compile_decode", None, started.elapsed());
            } else {
                inference_seconds += seconds;
            }
            let batch = step.len() as f64;
            log::debug!(
                "Iteration {iteration}: {:.1}ms @ {:.1} tok/s/user ({:.1} tok/s)",
                seconds * 1000.0,
                1.0 / seconds,
                batch / seconds
            );
            records.push(DecodeRecord {
                iteration,
                tokens: step,
                positions: pos.clone(),
                seconds,
            });
            if outputs.all_done() {
                log::info!("All users finished after {} decode iterations", iteration + 1);
                break;
            }
        }
        profiler.record("inference_decode", None, Duration::from_secs_f64(inference_seconds));
        self.mesh.synchronize()?;
        Ok(records)
    }
}
