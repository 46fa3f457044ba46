//! Simulated multi-chip Kernel Runtime for meshinfer.
//!
//! Models a mesh of accelerator chips closely enough to exercise the
//! generation engine end to end: per-device DRAM and L1 budgets, two
//! in-order command queues ordered only by events, a program cache, trace
//! capture and replay, sub-devices, global semaphores and collectives.
//! Numerics run in f32 on the host and are rounded to the tensor dtype
//! after every kernel.
//!
//! Commands run lazily. Nothing executes until the host blocks on a read,
//! an event or a queue, which is what makes missing events show up as
//! wrong results rather than being hidden by eager execution.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::similar_names
)]

pub mod config;
pub mod device;
mod index;
pub mod memory;
pub mod ops;
mod quant;
mod queue;
pub mod sub_device;
pub mod tensor;
mod trace;

use meshinfer::backend::Backend;

pub use config::MeshConfig;
pub use device::{SimEvent, SimMesh};
pub use memory::{DeviceData, MemoryUsage};
pub use sub_device::SimSemaphore;
pub use tensor::SimTensor;

/// Marker type for the simulated backend.
///
/// All op trait impls are on this type, so models parameterised by
/// `B: KernelRuntime` run on it unchanged.
pub struct SimBackend;

impl Backend for SimBackend {
    type Tensor = SimTensor;
    type Mesh = SimMesh;

    fn mesh_of(tensor: &SimTensor) -> SimMesh {
        tensor.mesh().clone()
    }
}
