//! Simulated implementations of all Kernel Runtime op traits.
//!
//! Every op validates its inputs on the host, allocates its output and
//! queues a kernel on CQ0. Kernels capture buffer ids and shapes, never
//! tensor handles, so a captured trace keeps running against the same
//! addresses.

pub mod argmax;
pub mod arith;
pub mod attention;
pub mod ccl;
pub mod embed;
pub mod io;
pub mod matmul;
pub mod norm;
pub mod rope;
pub mod tensor_ops;

use meshinfer::dtype::DType;
use meshinfer::mesh::QueueId;
use meshinfer::tensor::Tensor;
use meshinfer::{Error, Result};

use crate::device::SimMesh;
use crate::memory::DeviceMemory;
use crate::queue::Op;
use crate::tensor::SimTensor;

/// Queue a compute kernel on CQ0.
pub(crate) fn launch(
    mesh: &SimMesh,
    name: &'static str,
    program: String,
    tensors: &[&SimTensor],
    run: impl Fn(&mut DeviceMemory) -> Result<()> + 'static,
) -> Result<()> {
    mesh.enqueue(
        QueueId::COMPUTE,
        Op {
            name,
            program: Some(program),
            buffers: tensors.iter().map(|t| t.buffer()).collect(),
            run: Box::new(run),
        },
    )
}

/// Program cache key: the op name, every input's shape and placement, and
/// any op attributes.
pub(crate) fn program_key(name: &str, inputs: &[&SimTensor], attrs: &str) -> String {
    let specs: Vec<String> = inputs
        .iter()
        .map(|t| {
            let spec = t.spec();
            format!(
                "{:?}:{}:{:?}:{}:{:?}",
                t.shape(),
                spec.dtype,
                spec.layout,
                spec.memory,
                spec.mapping
            )
        })
        .collect();
    format!("{name}[{}]{{{attrs}}}", specs.join(","))
}

pub(crate) fn same_mesh(a: &SimTensor, b: &SimTensor) -> Result<()> {
    if a.mesh().mesh_id() != b.mesh().mesh_id() {
        return Err(Error::config("tensors live on different meshes"));
    }
    Ok(())
}

pub(crate) fn require_float(t: &SimTensor, op: &str) -> Result<()> {
    if !t.dtype().is_float() {
        return Err(Error::DtypeMismatch {
            expected: format!("float input to {op}"),
            got: t.dtype().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn require_dtype(t: &SimTensor, dtype: DType, op: &str) -> Result<()> {
    if t.dtype() != dtype {
        return Err(Error::DtypeMismatch {
            expected: format!("{dtype} input to {op}"),
            got: t.dtype().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn require_rank(t: &SimTensor, rank: usize, op: &str) -> Result<()> {
    if t.ndim() != rank {
        return Err(Error::InvalidShape(format!(
            "{op} expects a rank-{rank} tensor, got {:?}",
            t.shape()
        )));
    }
    Ok(())
}

pub(crate) fn require_shape(t: &SimTensor, expected: &[usize]) -> Result<()> {
    if t.shape() != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: t.shape().to_vec(),
        });
    }
    Ok(())
}
