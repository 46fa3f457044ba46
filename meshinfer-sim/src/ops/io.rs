//! TensorIo implementation: host transfers and allocation.

use std::cell::Cell;
use std::rc::Rc;

use meshinfer::backend::{MeshControl, TensorIo};
use meshinfer::dtype::DType;
use meshinfer::host::{HostBuffer, HostData};
use meshinfer::mesh::{MeshShape, QueueId};
use meshinfer::tensor::{MeshMapping, Tensor, TensorSpec};
use meshinfer::{Error, Result};

use crate::device::SimMesh;
use crate::memory::{DeviceData, DeviceMemory};
use crate::quant::quantize;
use crate::queue::Op;
use crate::tensor::SimTensor;
use crate::SimBackend;

fn check_host_data(data: &HostData, shape: &[usize], dtype: DType) -> Result<()> {
    let numel: usize = shape.iter().product();
    if data.len() != numel {
        return Err(Error::InvalidShape(format!(
            "host data has {} elements, shape {shape:?} needs {numel}",
            data.len()
        )));
    }
    let compatible = match data {
        HostData::F32(_) => dtype.is_float(),
        HostData::I32(_) => dtype == DType::I32,
        HostData::U32(_) => dtype == DType::U32,
    };
    if !compatible {
        return Err(Error::DtypeMismatch {
            expected: dtype.to_string(),
            got: data.dtype().to_string(),
        });
    }
    Ok(())
}

/// Split logical host data into per-device pieces rounded to `dtype`.
fn split(
    data: HostData,
    shape: &[usize],
    spec: &TensorSpec,
    mesh: MeshShape,
) -> Result<Vec<DeviceData>> {
    let global = DeviceData::from_host(data);
    (0..mesh.num_devices())
        .map(|device| {
            let mut piece = match spec.mapping {
                MeshMapping::Replicate => global.clone(),
                mapping => global.gather(shape, &mapping.device_ranges(shape, mesh, device)?),
            };
            if let DeviceData::F32(values) = &mut piece {
                quantize(spec.dtype, values);
            }
            Ok(piece)
        })
        .collect()
}

/// Reassemble the logical tensor from its per-device pieces.
pub(crate) fn assemble(
    mem: &DeviceMemory,
    id: u64,
    shape: &[usize],
    spec: &TensorSpec,
    mesh: MeshShape,
) -> Result<DeviceData> {
    if spec.mapping == MeshMapping::Replicate {
        return Ok(mem.data(id, 0)?.clone());
    }
    let mut out = DeviceData::zeros(spec.dtype, shape.iter().product());
    for device in 0..mesh.num_devices() {
        let ranges = spec.mapping.device_ranges(shape, mesh, device)?;
        out.scatter(shape, &ranges, mem.data(id, device)?)?;
    }
    Ok(out)
}

fn write_op(dst: &SimTensor, pieces: Vec<DeviceData>, done: Option<Rc<Cell<bool>>>) -> Op {
    let id = dst.id();
    Op {
        name: "write",
        program: None,
        buffers: vec![dst.buffer()],
        run: Box::new(move |mem: &mut DeviceMemory| {
            for (device, piece) in pieces.iter().enumerate() {
                mem.store(id, device, piece.clone())?;
            }
            if let Some(done) = &done {
                done.set(true);
            }
            Ok(())
        }),
    }
}

impl TensorIo for SimBackend {
    fn from_host(
        mesh: &SimMesh,
        shape: &[usize],
        data: HostData,
        spec: TensorSpec,
    ) -> Result<SimTensor> {
        check_host_data(&data, shape, spec.dtype)?;
        let tensor = mesh.allocate(shape, spec, "host upload")?;
        let pieces = split(data, shape, &spec, mesh.shape())?;
        let done = Rc::new(Cell::new(false));
        mesh.enqueue(
            QueueId::COMPUTE,
            write_op(&tensor, pieces, Some(Rc::clone(&done))),
        )?;
        mesh.pump_until("blocking write", |_| done.get())?;
        Ok(tensor)
    }

    fn zeros(mesh: &SimMesh, shape: &[usize], spec: TensorSpec) -> Result<SimTensor> {
        mesh.allocate(shape, spec, "zeros")
    }

    fn to_host(tensor: &SimTensor) -> Result<HostData> {
        let buffer = HostBuffer::new();
        Self::read_async(QueueId::COMPUTE, tensor, &buffer)?;
        tensor
            .mesh()
            .pump_until("blocking read", |_| buffer.is_filled())?;
        buffer.take()
    }

    fn to_host_device(tensor: &SimTensor, device: usize) -> Result<HostData> {
        let mesh = tensor.mesh();
        if device >= mesh.num_devices() {
            return Err(Error::config(format!(
                "device {device} out of range for a {} mesh",
                mesh.shape()
            )));
        }
        let buffer = HostBuffer::new();
        let landing = buffer.clone();
        let id = tensor.id();
        mesh.enqueue(
            QueueId::COMPUTE,
            Op {
                name: "read",
                program: None,
                buffers: vec![tensor.buffer()],
                run: Box::new(move |mem: &mut DeviceMemory| {
                    landing.fill(mem.data(id, device)?.clone().into_host());
                    Ok(())
                }),
            },
        )?;
        mesh.pump_until("blocking read", |_| buffer.is_filled())?;
        buffer.take()
    }

    fn copy_host_to_device(queue: QueueId, src: HostData, dst: &SimTensor) -> Result<()> {
        check_host_data(&src, dst.shape(), dst.dtype())?;
        let mesh = dst.mesh();
        let pieces = split(src, dst.shape(), dst.spec(), mesh.shape())?;
        mesh.enqueue(queue, write_op(dst, pieces, None))
    }

    fn read_async(queue: QueueId, src: &SimTensor, dst: &HostBuffer) -> Result<()> {
        let mesh = src.mesh();
        let id = src.id();
        let shape = src.shape().to_vec();
        let spec = *src.spec();
        let mesh_shape = mesh.shape();
        let landing = dst.clone();
        mesh.enqueue(
            queue,
            Op {
                name: "read",
                program: None,
                buffers: vec![src.buffer()],
                run: Box::new(move |mem: &mut DeviceMemory| {
                    let data = assemble(mem, id, &shape, &spec, mesh_shape)?;
                    landing.fill(data.into_host());
                    Ok(())
                }),
            },
        )
    }

    fn deallocate(tensor: &SimTensor) {
        tensor.mesh().free_now(tensor.id());
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::tensor::MeshMapping;

    use super::*;
    use crate::config::MeshConfig;

    #[test]
    fn test_upload_rounds_to_dtype() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let t = SimBackend::from_host(
            &mesh,
            &[2],
            HostData::F32(vec![1.001, 2.0]),
            TensorSpec::new(DType::BF16),
        )
        .unwrap();
        assert_eq!(SimBackend::to_host(&t).unwrap(), HostData::F32(vec![1.0, 2.0]));
    }

    #[test]
    fn test_sharded_round_trip_and_local_pieces() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let data: Vec<u32> = (0..8).collect();
        let t = SimBackend::from_host(
            &mesh,
            &[2, 4],
            HostData::U32(data.clone()),
            TensorSpec::new(DType::U32)
                .row_major()
                .with_mapping(MeshMapping::Shard { dim: 1 }),
        )
        .unwrap();
        assert_eq!(t.local_shape(), &[2, 2]);
        assert_eq!(
            SimBackend::to_host_device(&t, 1).unwrap(),
            HostData::U32(vec![2, 3, 6, 7])
        );
        assert_eq!(SimBackend::to_host(&t).unwrap(), HostData::U32(data));
    }

    #[test]
    fn test_wrong_host_dtype_is_rejected() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let err = SimBackend::from_host(
            &mesh,
            &[2],
            HostData::F32(vec![1.0, 2.0]),
            TensorSpec::new(DType::I32),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_async_read_lands_after_event() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let t = SimBackend::from_host(
            &mesh,
            &[3],
            HostData::I32(vec![4, 5, 6]),
            TensorSpec::new(DType::I32).row_major(),
        )
        .unwrap();
        let landing = HostBuffer::new();
        let event = mesh.create_event();
        SimBackend::read_async(QueueId::TRANSFER, &t, &landing).unwrap();
        mesh.record_event(QueueId::TRANSFER, &event).unwrap();
        assert!(!landing.is_filled());
        mesh.event_synchronize(&event).unwrap();
        assert_eq!(landing.take().unwrap(), HostData::I32(vec![4, 5, 6]));
    }

    #[test]
    fn test_deallocated_tensor_cannot_be_read() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let t = SimBackend::zeros(&mesh, &[32], TensorSpec::new(DType::F32)).unwrap();
        SimBackend::deallocate(&t);
        assert!(!t.is_allocated());
        assert!(SimBackend::to_host(&t).is_err());
    }
}
