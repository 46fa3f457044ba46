//! Capture of one decode step into a replayable trace.
//!
//! The trace reads three small device tensors (next token, position and
//! rotation index) plus the page table and KV slabs, and writes the next
//! token (or row-major logits) back into a tensor bound at capture time.
//! Replays therefore only need the transfer queue to refresh the rotation
//! index between steps.

use meshinfer::model::{Model, RotationInputs, TensorOf};
use meshinfer::{
    ArithOps, CollectiveOps, CollectiveSetup, DType, Error, HostData, Layout,
    LayoutOps, MeshControl, MeshMapping, QueueId, Result, SemaphoreOf, Tensor, TensorIo,
    TensorSpec, TraceId,
};

use crate::kv_cache::KvCacheManager;
use crate::rope_index::RopeIndex;
use crate::sampler::device_argmax;

/// The mutable device inputs a decode trace is bound to.
pub struct DecodeInputs<T> {
    /// `U32` `[1, B]`: token fed to the step, overwritten by device argmax.
    pub tokens: T,
    /// `I32` `[B]`: position each user's token is written at.
    pub cur_pos: T,
    /// `I32` `[1, B]`: RoPE row each user reads.
    pub rot_idxs: T,
}

impl<T> DecodeInputs<T> {
    /// Upload the starting values of all three inputs.
    ///
    /// # Errors
    /// Returns an error if an upload fails.
    pub fn upload<B: TensorIo<Tensor = T>>(mesh: &B::Mesh, tokens: &[u32], positions: &[i32]) -> Result<Self> {
        if tokens.len() != positions.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![tokens.len()],
                got: vec![positions.len()],
            });
        }
        let batch = tokens.len();
        Ok(Self {
            tokens: B::from_host(
                mesh,
                &[1, batch],
                HostData::U32(tokens.to_vec()),
                TensorSpec::new(DType::U32).row_major(),
            )?,
            cur_pos: B::from_host(
                mesh,
                &[batch],
                HostData::I32(positions.to_vec()),
                TensorSpec::new(DType::I32).row_major(),
            )?,
            rot_idxs: B::from_host(
                mesh,
                &[1, batch],
                HostData::I32(positions.to_vec()),
                TensorSpec::new(DType::I32).row_major(),
            )?,
        })
    }

    /// Overwrite all three inputs from the host on `queue`.
    ///
    /// # Errors
    /// Returns an error if a copy cannot be enqueued.
    pub fn reset<B: TensorIo<Tensor = T>>(&self, queue: QueueId, tokens: &[u32], positions: &[i32]) -> Result<()> {
        B::copy_host_to_device(queue, HostData::U32(tokens.to_vec()), &self.tokens)?;
        B::copy_host_to_device(queue, HostData::I32(positions.to_vec()), &self.cur_pos)?;
        B::copy_host_to_device(queue, HostData::I32(positions.to_vec()), &self.rot_idxs)
    }
}

/// A captured decode step and the tensors it is bound to.
pub struct DecodeTrace<T> {
    pub id: TraceId,
    pub inputs: DecodeInputs<T>,
    /// Next-token tensor with device argmax, row-major `[1, 1, B, vocab]`
    /// logits otherwise.
    pub output: T,
    pub argmax_on_device: bool,
}

impl<T> DecodeTrace<T> {
    #[must_use]
    pub fn batch_size(&self) -> usize
    where
        T: Tensor,
    {
        self.inputs.tokens.numel()
    }
}

/// Issues the decode step body, eagerly or into a capture.
pub struct TraceBuilder<'a, M: Model> {
    model: &'a M,
    rope: &'a RopeIndex<M::B>,
    kv: &'a KvCacheManager<M::B>,
    ccl: &'a CollectiveSetup<SemaphoreOf<M::B>>,
}

impl<'a, M: Model> TraceBuilder<'a, M> {
    #[must_use]
    pub fn new(
        model: &'a M,
        rope: &'a RopeIndex<M::B>,
        kv: &'a KvCacheManager<M::B>,
        ccl: &'a CollectiveSetup<SemaphoreOf<M::B>>,
    ) -> Self {
        Self {
            model,
            rope,
            kv,
            ccl,
        }
    }

    /// Enqueue one decode step on the compute queue.
    ///
    /// The sequence is fixed: embed, move into the decode residual memory,
    /// forward, gather the vocab shards, untilize, then argmax into
    /// `inputs.tokens` when `argmax_on_device`, and finally advance
    /// `inputs.cur_pos`. Returns the tensor the host reads.
    ///
    /// # Errors
    /// Returns the first kernel error.
    pub fn decode_step(&self, inputs: &DecodeInputs<TensorOf<M>>, argmax_on_device: bool) -> Result<TensorOf<M>> {
        let args = self.model.args();
        let mesh = self.model.mesh();
        let batch = inputs.tokens.numel();

        let x = self.model.embed(&inputs.tokens)?;
        let x = <M::B as LayoutOps>::reshape(&x, &[1, 1, batch, args.dim])?;
        let x = <M::B as LayoutOps>::to_memory_config(&x, args.decode_residual_memory(mesh.compute_grid()))?;

        let (cos, sin) = self.rope.rot_mats_from_idxs(&inputs.rot_idxs)?;
        let rot = RotationInputs {
            cos: &cos,
            sin: &sin,
            trans_mat: self.rope.get_trans_mats(),
        };
        let logits = self.model.decode_forward(
            &x,
            &inputs.cur_pos,
            &rot,
            self.kv.page_table(),
            self.kv.per_layer_handles(),
        )?;
        let logits = if logits.mapping() == MeshMapping::Replicate {
            logits
        } else {
            <M::B as CollectiveOps>::all_gather(&logits, 3, self.ccl.params())?
        };
        let logits = <M::B as LayoutOps>::to_layout(&logits, Layout::RowMajor)?;

        let output = if argmax_on_device {
            device_argmax::<M::B>(&logits, &inputs.tokens)?;
            inputs.tokens.clone()
        } else {
            logits
        };
        <M::B as ArithOps>::plus_one(&inputs.cur_pos)?;
        Ok(output)
    }

    /// Warm the program cache with one eager step, capture the same step on
    /// the compute queue, then restore the inputs to `tokens`/`positions`.
    ///
    /// # Errors
    /// Returns an error from the warmup, `ProgramNotCompiled` if the
    /// captured sequence differs from the warmup, or `OutOfMemory` if the
    /// trace region is too small.
    pub fn capture(&self, tokens: &[u32], positions: &[i32], argmax_on_device: bool) -> Result<DecodeTrace<TensorOf<M>>> {
        let mesh = self.model.mesh();
        let inputs = DecodeInputs::upload::<M::B>(mesh, tokens, positions)?;

        self.decode_step(&inputs, argmax_on_device)?;

        let id = mesh.begin_trace_capture(QueueId::COMPUTE)?;
        let captured = self.decode_step(&inputs, argmax_on_device);
        let ended = mesh.end_trace_capture(QueueId::COMPUTE, id);
        let output = match captured {
            Ok(output) => output,
            Err(e) => {
                if ended.is_ok() {
                    mesh.release_trace(id)?;
                }
                return Err(e);
            }
        };
        ended?;

        inputs.reset::<M::B>(QueueId::COMPUTE, tokens, positions)?;
        log::info!(
            "Captured decode trace {} for {} users ({} argmax)",
            id.0,
            tokens.len(),
            if argmax_on_device { "device" } else { "host" }
        );
        Ok(DecodeTrace {
            id,
            inputs,
            output,
            argmax_on_device,
        })
    }
}
