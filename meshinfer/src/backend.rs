//! Backend trait and op trait definitions for the Kernel Runtime.
//!
//! Models and the generation engine are generic over `B: Backend` and use op
//! traits like `MatmulOps`, `AttentionOps`, etc. to express their compute
//! requirements. A backend implements these traits with its own tensor and
//! mesh types.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`**: they use `Self::Tensor` from the
//!   supertrait, avoiding repetition.
//! - **Tensors know their mesh.** Ops take only tensors; the output is
//!   allocated on the mesh of the first input and enqueued on the compute
//!   queue. Creation from host data is the only place a mesh is passed.
//! - **Ops enqueue, they don't run.** Every op validates its inputs on the
//!   host and returns immediately. Execution order is queue order; the host
//!   observes results only through blocking reads, events or `synchronize`.
//! - **Queue, event, trace and sub-device control** live on [`MeshControl`],
//!   implemented by the backend's mesh handle.

use crate::dtype::DType;
use crate::host::{HostBuffer, HostData};
use crate::mesh::{
    CollectiveParams, CoreRangeSet, MeshShape, QueueId, SubDevice, SubDeviceId,
    SubDeviceManagerId, TraceId,
};
use crate::tensor::{CoreGrid, Layout, MemoryConfig, Tensor, TensorSpec};
use crate::Result;

// ---- Core backend trait ----

/// A Kernel Runtime backend.
pub trait Backend: 'static {
    /// Device tensor handle. Clones alias the same device buffer.
    type Tensor: Tensor + Clone;

    /// Handle to an open device mesh.
    type Mesh: MeshControl;

    /// Mesh a tensor lives on.
    fn mesh_of(tensor: &Self::Tensor) -> Self::Mesh;
}

/// Event type of a backend's mesh.
pub type EventOf<B> = <<B as Backend>::Mesh as MeshControl>::Event;

/// Global semaphore type of a backend's mesh.
pub type SemaphoreOf<B> = <<B as Backend>::Mesh as MeshControl>::Semaphore;

/// A device-resident counter shared by every chip of a mesh.
pub trait GlobalSemaphore {
    /// L1 address of the semaphore on each device, in device order.
    fn addresses(&self) -> Vec<usize>;
}

/// Device, queue, event, trace and sub-device control for an open mesh.
pub trait MeshControl: Clone {
    type Event: Clone;
    type Semaphore: GlobalSemaphore + Clone;

    fn shape(&self) -> MeshShape;

    fn num_command_queues(&self) -> usize;

    /// Worker grid available on each chip.
    fn compute_grid(&self) -> CoreGrid;

    fn enable_program_cache(&self);

    /// Number of distinct programs compiled so far.
    fn program_cache_entries(&self) -> usize;

    // ---- Events ----

    fn create_event(&self) -> Self::Event;

    /// Enqueue a record of `event` on `queue`.
    ///
    /// # Errors
    /// Returns an error if the queue does not exist.
    fn record_event(&self, queue: QueueId, event: &Self::Event) -> Result<()>;

    /// Enqueue a wait on the most recently enqueued record of `event`.
    ///
    /// # Errors
    /// Returns an error if the queue does not exist.
    fn wait_for_event(&self, queue: QueueId, event: &Self::Event) -> Result<()>;

    /// Block the host until the most recent record of `event` has executed.
    ///
    /// # Errors
    /// Returns an error if a command fails or the queues can make no progress.
    fn event_synchronize(&self, event: &Self::Event) -> Result<()>;

    /// Block until all outstanding work on the current stall group finishes.
    ///
    /// # Errors
    /// Returns an error if a command fails or the queues can make no progress.
    fn synchronize(&self) -> Result<()>;

    // ---- Traces ----

    /// Start recording commands issued to `queue` into a new trace.
    ///
    /// # Errors
    /// Returns an error if a capture is already in progress.
    fn begin_trace_capture(&self, queue: QueueId) -> Result<TraceId>;

    /// Finish the capture started by [`Self::begin_trace_capture`].
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the trace does not fit in the reserved region.
    fn end_trace_capture(&self, queue: QueueId, trace: TraceId) -> Result<()>;

    /// Enqueue a replay of `trace` on `queue`.
    ///
    /// # Errors
    /// Returns `TraceInvalidated` if a bound buffer was freed since capture.
    fn execute_trace(&self, queue: QueueId, trace: TraceId, blocking: bool) -> Result<()>;

    /// # Errors
    /// Returns an error for an unknown trace id.
    fn release_trace(&self, trace: TraceId) -> Result<()>;

    // ---- Sub-devices ----

    /// # Errors
    /// Returns an error if the core sets overlap or fall outside the grid.
    fn create_sub_device_manager(
        &self,
        sub_devices: &[SubDevice],
        local_l1_size: usize,
    ) -> Result<SubDeviceManagerId>;

    /// # Errors
    /// Returns an error for an unknown manager id.
    fn load_sub_device_manager(&self, manager: SubDeviceManagerId) -> Result<()>;

    /// # Errors
    /// Returns an error if no manager is loaded.
    fn clear_loaded_sub_device_manager(&self) -> Result<()>;

    /// # Errors
    /// Returns an error if the manager is unknown or still loaded.
    fn remove_sub_device_manager(&self, manager: SubDeviceManagerId) -> Result<()>;

    /// # Errors
    /// Returns an error if any id is not part of the loaded manager.
    fn set_sub_device_stall_group(&self, sub_devices: &[SubDeviceId]) -> Result<()>;

    /// # Errors
    /// Returns an error if no manager is loaded.
    fn reset_sub_device_stall_group(&self) -> Result<()>;

    // ---- Collective plumbing ----

    /// # Errors
    /// Returns `OutOfMemory` if the cores have no L1 left for the counter.
    fn create_global_semaphore(&self, cores: &CoreRangeSet, initial: u32)
        -> Result<Self::Semaphore>;

    /// # Errors
    /// Returns an error if the semaphore was created on another mesh.
    fn reset_global_semaphore(&self, semaphore: &Self::Semaphore, value: u32) -> Result<()>;

    /// # Errors
    /// Returns an error if the fabric is already up.
    fn enable_persistent_fabric(&self) -> Result<()>;

    /// # Errors
    /// Returns an error if the fabric is not up.
    fn teardown_persistent_fabric(&self) -> Result<()>;

    /// Drain both queues and release every device resource.
    ///
    /// # Errors
    /// Returns an error if outstanding work fails.
    fn close(&self) -> Result<()>;
}

// ---- Op traits ----

/// Host <-> device transfers and allocation.
pub trait TensorIo: Backend {
    /// Allocate a tensor and fill it from host data (blocking write on CQ0).
    ///
    /// Sharded mappings split `data` across devices.
    fn from_host(
        mesh: &Self::Mesh,
        shape: &[usize],
        data: HostData,
        spec: TensorSpec,
    ) -> Result<Self::Tensor>;

    /// Allocate a zero-filled tensor.
    fn zeros(mesh: &Self::Mesh, shape: &[usize], spec: TensorSpec) -> Result<Self::Tensor>;

    /// Blocking read. Sharded tensors are concatenated back into the
    /// logical shape; replicated tensors are read from device 0.
    fn to_host(tensor: &Self::Tensor) -> Result<HostData>;

    /// Blocking read of one device's local piece.
    fn to_host_device(tensor: &Self::Tensor, device: usize) -> Result<HostData>;

    /// Enqueue a host-to-device copy into an existing tensor.
    fn copy_host_to_device(queue: QueueId, src: HostData, dst: &Self::Tensor) -> Result<()>;

    /// Enqueue a device-to-host read that lands in `dst` when it executes.
    fn read_async(queue: QueueId, src: &Self::Tensor, dst: &HostBuffer) -> Result<()>;

    /// Free the device buffer now, even if handles remain.
    fn deallocate(tensor: &Self::Tensor);
}

/// Layout, placement and shape manipulation.
pub trait LayoutOps: Backend {
    /// View with a new shape (same element count, same buffer).
    fn reshape(input: &Self::Tensor, shape: &[usize]) -> Result<Self::Tensor>;

    /// Tilize or untilize.
    fn to_layout(input: &Self::Tensor, layout: Layout) -> Result<Self::Tensor>;

    /// Move into another memory placement.
    fn to_memory_config(input: &Self::Tensor, memory: MemoryConfig) -> Result<Self::Tensor>;

    fn typecast(input: &Self::Tensor, dtype: DType) -> Result<Self::Tensor>;

    /// Keep `start..end` along `dim`.
    fn slice(input: &Self::Tensor, dim: usize, start: usize, end: usize) -> Result<Self::Tensor>;

    fn concat(inputs: &[&Self::Tensor], dim: usize) -> Result<Self::Tensor>;

    fn permute(input: &Self::Tensor, dims: &[usize]) -> Result<Self::Tensor>;
}

/// Embedding lookup.
pub trait EmbedOps: Backend {
    /// Gather rows of `weight` (`[vocab, dim]`) addressed by `indices`.
    ///
    /// `indices` must be `U32`; the output shape is `indices.shape + [dim]`.
    fn embedding(indices: &Self::Tensor, weight: &Self::Tensor, layout: Layout)
        -> Result<Self::Tensor>;
}

/// Normalization operations.
pub trait NormOps: Backend {
    /// RMS normalization over the last dim.
    fn rms_norm(input: &Self::Tensor, weight: &Self::Tensor, eps: f32) -> Result<Self::Tensor>;
}

/// Matmul precision knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MathFidelity {
    LoFi,
    HiFi2,
    HiFi4,
}

/// Activation fused into a matmul epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Silu,
}

/// Per-call matmul options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatmulConfig {
    pub fidelity: MathFidelity,
    pub activation: Option<Activation>,
    /// Output dtype; defaults to the input's.
    pub output_dtype: Option<DType>,
    /// Output placement; defaults to DRAM.
    pub memory: Option<MemoryConfig>,
}

impl Default for MatmulConfig {
    fn default() -> Self {
        Self {
            fidelity: MathFidelity::HiFi2,
            activation: None,
            output_dtype: None,
            memory: None,
        }
    }
}

/// Matrix multiplication.
pub trait MatmulOps: Backend {
    /// `input @ weight` where `weight` is `[1, 1, K, N]`.
    ///
    /// If `weight` is sharded along K each device produces a partial sum that
    /// must be combined with [`CollectiveOps::all_reduce`].
    fn linear(
        input: &Self::Tensor,
        weight: &Self::Tensor,
        config: &MatmulConfig,
    ) -> Result<Self::Tensor>;
}

/// Element-wise arithmetic.
pub trait ArithOps: Backend {
    fn add(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    fn mul(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    fn silu(input: &Self::Tensor) -> Result<Self::Tensor>;

    /// In-place `+1` on an `I32` tensor.
    fn plus_one(tensor: &Self::Tensor) -> Result<()>;

    /// In-place zero fill.
    fn fill_zero(tensor: &Self::Tensor) -> Result<()>;
}

/// Rotary position embedding.
pub trait RopeOps: Backend {
    /// `x * cos + (x @ trans_mat) * sin`, with `cos`/`sin` broadcast over heads.
    fn rotary_embedding(
        input: &Self::Tensor,
        cos: &Self::Tensor,
        sin: &Self::Tensor,
        trans_mat: &Self::Tensor,
    ) -> Result<Self::Tensor>;
}

/// KV-cache writes and scaled dot-product attention.
///
/// Contiguous caches are `[max_batch, n_kv_heads, max_seq_len, head_dim]`.
/// Paged caches are `[max_num_blocks, n_kv_heads, block_size, head_dim]`,
/// addressed through an `I32` page table `[max_batch, blocks_per_user]`.
pub trait AttentionOps: Backend {
    /// Write a prefilled `[1, n_kv, S, head_dim]` sequence for `user`.
    /// Positions past the user's cache capacity are skipped.
    fn fill_cache(
        cache: &Self::Tensor,
        input: &Self::Tensor,
        user: usize,
        page_table: Option<&Self::Tensor>,
    ) -> Result<()>;

    /// Write one `[1, B, n_kv, head_dim]` row per user at `cur_pos[user]`.
    fn update_cache(
        cache: &Self::Tensor,
        input: &Self::Tensor,
        cur_pos: &Self::Tensor,
        page_table: Option<&Self::Tensor>,
    ) -> Result<()>;

    /// Causal attention over a `[1, heads, S, head_dim]` prompt.
    fn sdpa_prefill(
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        scale: f32,
    ) -> Result<Self::Tensor>;

    /// Single-token attention for `[1, B, heads, head_dim]` queries against
    /// positions `0..=cur_pos[user]` of the cache.
    fn sdpa_decode(
        q: &Self::Tensor,
        k_cache: &Self::Tensor,
        v_cache: &Self::Tensor,
        cur_pos: &Self::Tensor,
        page_table: Option<&Self::Tensor>,
        scale: f32,
    ) -> Result<Self::Tensor>;
}

/// On-device reductions.
pub trait ArgmaxOps: Backend {
    /// Argmax along the last dim of a row-major tensor, written into a
    /// caller-supplied `U32` tensor holding one element per row.
    fn argmax_into(input: &Self::Tensor, output: &Self::Tensor) -> Result<()>;
}

/// Cross-device collectives.
pub trait CollectiveOps: Backend {
    /// Concatenate the per-device pieces along `dim`; result is replicated.
    fn all_gather(
        input: &Self::Tensor,
        dim: usize,
        params: CollectiveParams<'_, SemaphoreOf<Self>>,
    ) -> Result<Self::Tensor>;

    /// Sum the per-device values; result is replicated.
    fn all_reduce(
        input: &Self::Tensor,
        params: CollectiveParams<'_, SemaphoreOf<Self>>,
    ) -> Result<Self::Tensor>;

    /// Sum the per-device values and shard the result along `dim`.
    fn reduce_scatter(
        input: &Self::Tensor,
        dim: usize,
        params: CollectiveParams<'_, SemaphoreOf<Self>>,
    ) -> Result<Self::Tensor>;
}

/// Every op the generation engine needs, as one bound.
pub trait KernelRuntime:
    TensorIo
    + LayoutOps
    + EmbedOps
    + NormOps
    + MatmulOps
    + ArithOps
    + RopeOps
    + AttentionOps
    + ArgmaxOps
    + CollectiveOps
{
}

impl<T> KernelRuntime for T where
    T: TensorIo
        + LayoutOps
        + EmbedOps
        + NormOps
        + MatmulOps
        + ArithOps
        + RopeOps
        + AttentionOps
        + ArgmaxOps
        + CollectiveOps
{
}
