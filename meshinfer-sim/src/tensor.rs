//! Simulated device tensor.

use std::fmt;
use std::rc::{Rc, Weak};

use meshinfer::tensor::{Tensor, TensorSpec};

use crate::device::{MeshInner, SimMesh};
use crate::memory::BufferId;

/// Owning reference to a device buffer.
///
/// Dropping the last reference queues the buffer for release; the mesh frees
/// it the next time it touches its allocator.
pub(crate) struct BufferRef {
    pub id: BufferId,
    mesh: Weak<MeshInner>,
}

impl BufferRef {
    pub(crate) fn new(id: BufferId, mesh: Weak<MeshInner>) -> Self {
        Self { id, mesh }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if let Some(mesh) = self.mesh.upgrade() {
            mesh.defer_free(self.id);
        }
    }
}

/// A tensor distributed over the chips of a [`SimMesh`].
///
/// Clones and reshapes alias the same buffer.
#[derive(Clone)]
pub struct SimTensor {
    mesh: SimMesh,
    buffer: Rc<BufferRef>,
    shape: Vec<usize>,
    local_shape: Vec<usize>,
    spec: TensorSpec,
}

impl SimTensor {
    pub(crate) fn new(
        mesh: SimMesh,
        buffer: Rc<BufferRef>,
        shape: Vec<usize>,
        local_shape: Vec<usize>,
        spec: TensorSpec,
    ) -> Self {
        Self {
            mesh,
            buffer,
            shape,
            local_shape,
            spec,
        }
    }

    #[must_use]
    pub fn mesh(&self) -> &SimMesh {
        &self.mesh
    }

    /// Shape of the piece each device holds.
    #[must_use]
    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }

    #[must_use]
    pub fn local_numel(&self) -> usize {
        self.local_shape.iter().product()
    }

    /// False once the buffer has been force-freed.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.mesh.is_live(self.buffer.id)
    }

    pub(crate) fn id(&self) -> BufferId {
        self.buffer.id
    }

    pub(crate) fn buffer(&self) -> Rc<BufferRef> {
        Rc::clone(&self.buffer)
    }

    /// Same buffer, new logical shape and spec.
    pub(crate) fn view(&self, shape: Vec<usize>, local_shape: Vec<usize>, spec: TensorSpec) -> Self {
        Self {
            mesh: self.mesh.clone(),
            buffer: Rc::clone(&self.buffer),
            shape,
            local_shape,
            spec,
        }
    }
}

impl Tensor for SimTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn spec(&self) -> &TensorSpec {
        &self.spec
    }
}

impl fmt::Debug for SimTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTensor")
            .field("buffer", &self.buffer.id)
            .field("shape", &self.shape)
            .field("local_shape", &self.local_shape)
            .field("spec", &self.spec)
            .finish()
    }
}
