//! CollectiveOps implementation for SimBackend.
//!
//! Collectives run as a single kernel that sees every device's memory, so
//! topology only affects the program key and the log. Async collectives
//! (those carrying a global semaphore) need the persistent fabric and a
//! semaphore that was reset to zero.

use meshinfer::backend::{CollectiveOps, MeshControl};
use meshinfer::mesh::{CollectiveParams, MeshShape};
use meshinfer::tensor::{MeshMapping, Tensor, TensorSpec};
use meshinfer::{Error, Result};

use crate::memory::{DeviceData, DeviceMemory};
use crate::ops::io::assemble;
use crate::ops::{launch, program_key, require_float};
use crate::quant::quantize;
use crate::sub_device::SimSemaphore;
use crate::tensor::SimTensor;
use crate::SimBackend;

/// Validate the async plumbing; returns the semaphore slot to check.
fn plumbing(input: &SimTensor, params: &CollectiveParams<'_, SimSemaphore>) -> Result<Option<usize>> {
    input
        .mesh()
        .check_collective(params.semaphore, params.sub_device)?;
    Ok(params.semaphore.map(|s| s.index))
}

fn take_semaphore(mem: &mut DeviceMemory, slot: Option<usize>) -> Result<()> {
    if let Some(index) = slot {
        if mem.semaphore(index)? != 0 {
            return Err(Error::Device(format!(
                "global semaphore {index} was not reset before the collective"
            )));
        }
    }
    Ok(())
}

fn attrs(params: &CollectiveParams<'_, SimSemaphore>, dim: Option<usize>) -> String {
    format!(
        "{:?}:{dim:?}:{}:{:?}",
        params.topology,
        params.semaphore.is_some(),
        params.sub_device
    )
}

/// Mapping left after gathering the mesh axis that splits `dim`.
fn gathered_mapping(mapping: MeshMapping, dim: usize) -> Result<MeshMapping> {
    match mapping {
        MeshMapping::Shard { dim: d } if d == dim => Ok(MeshMapping::Replicate),
        MeshMapping::Shard2d { mesh_shape, dims } => {
            let dims = match dims {
                (Some(d), col) if d == dim => (None, col),
                (row, Some(d)) if d == dim => (row, None),
                _ => {
                    return Err(Error::config(format!(
                        "all_gather along dim {dim} but tensor is split along {dims:?}"
                    )))
                }
            };
            Ok(if dims == (None, None) {
                MeshMapping::Replicate
            } else {
                MeshMapping::Shard2d { mesh_shape, dims }
            })
        }
        other => Err(Error::config(format!(
            "all_gather along dim {dim} of a tensor mapped {other:?}"
        ))),
    }
}

/// Sum every device's partial, in device order.
fn sum_partials(mem: &DeviceMemory, id: u64, devices: usize) -> Result<Vec<f32>> {
    let mut total = mem.f32(id, 0)?.to_vec();
    for device in 1..devices {
        for (t, x) in total.iter_mut().zip(mem.f32(id, device)?) {
            *t += x;
        }
    }
    Ok(total)
}

fn store_split(
    mem: &mut DeviceMemory,
    dst: u64,
    global: &DeviceData,
    shape: &[usize],
    mapping: MeshMapping,
    mesh: MeshShape,
) -> Result<()> {
    for device in 0..mesh.num_devices() {
        let piece = match mapping {
            MeshMapping::Replicate => global.clone(),
            m => global.gather(shape, &m.device_ranges(shape, mesh, device)?),
        };
        mem.store(dst, device, piece)?;
    }
    Ok(())
}

fn require_partials(input: &SimTensor, op: &str) -> Result<()> {
    require_float(input, op)?;
    if input.mapping() != MeshMapping::Replicate {
        return Err(Error::config(format!(
            "{op} expects per-device partial sums, got a tensor mapped {:?}",
            input.mapping()
        )));
    }
    Ok(())
}

impl CollectiveOps for SimBackend {
    fn all_gather(
        input: &SimTensor,
        dim: usize,
        params: CollectiveParams<'_, SimSemaphore>,
    ) -> Result<SimTensor> {
        let slot = plumbing(input, &params)?;
        let mapping = gathered_mapping(input.mapping(), dim)?;
        let mesh = input.mesh();
        let spec = TensorSpec {
            mapping,
            ..input.spec().with_memory(meshinfer::tensor::MemoryConfig::Dram)
        };
        let output = mesh.allocate(input.shape(), spec, "all_gather")?;
        let (src, dst) = (input.id(), output.id());
        let shape = input.shape().to_vec();
        let in_spec = *input.spec();
        let mesh_shape = mesh.shape();
        log::trace!("all_gather dim {dim} of {shape:?} over {:?}", params.topology);
        let key = program_key("all_gather", &[input], &attrs(&params, Some(dim)));
        launch(mesh, "all_gather", key, &[input, &output], move |mem| {
            take_semaphore(mem, slot)?;
            let global = assemble(mem, src, &shape, &in_spec, mesh_shape)?;
            store_split(mem, dst, &global, &shape, mapping, mesh_shape)
        })?;
        Ok(output)
    }

    fn all_reduce(input: &SimTensor, params: CollectiveParams<'_, SimSemaphore>) -> Result<SimTensor> {
        require_partials(input, "all_reduce")?;
        let slot = plumbing(input, &params)?;
        let mesh = input.mesh();
        let output = mesh.allocate(input.shape(), *input.spec(), "all_reduce")?;
        let (src, dst) = (input.id(), output.id());
        let dtype = input.dtype();
        let devices = mesh.num_devices();
        log::trace!("all_reduce {:?} over {:?}", input.shape(), params.topology);
        let key = program_key("all_reduce", &[input], &attrs(&params, None));
        launch(mesh, "all_reduce", key, &[input, &output], move |mem| {
            take_semaphore(mem, slot)?;
            let mut total = sum_partials(mem, src, devices)?;
            quantize(dtype, &mut total);
            for device in 0..devices {
                mem.store(dst, device, DeviceData::F32(total.clone()))?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn reduce_scatter(
        input: &SimTensor,
        dim: usize,
        params: CollectiveParams<'_, SimSemaphore>,
    ) -> Result<SimTensor> {
        require_partials(input, "reduce_scatter")?;
        let slot = plumbing(input, &params)?;
        let mesh = input.mesh();
        let mapping = MeshMapping::Shard { dim };
        let output = mesh.allocate(input.shape(), input.spec().with_mapping(mapping), "reduce_scatter")?;
        let (src, dst) = (input.id(), output.id());
        let shape = input.shape().to_vec();
        let dtype = input.dtype();
        let mesh_shape = mesh.shape();
        log::trace!("reduce_scatter dim {dim} of {shape:?} over {:?}", params.topology);
        let key = program_key("reduce_scatter", &[input], &attrs(&params, Some(dim)));
        launch(mesh, "reduce_scatter", key, &[input, &output], move |mem| {
            take_semaphore(mem, slot)?;
            let mut total = sum_partials(mem, src, mesh_shape.num_devices())?;
            quantize(dtype, &mut total);
            store_split(mem, dst, &DeviceData::F32(total), &shape, mapping, mesh_shape)
        })?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::backend::{MeshControl, TensorIo};
    use meshinfer::dtype::DType;
    use meshinfer::host::HostData;
    use meshinfer::mesh::{CoreCoord, CoreRange, CoreRangeSet, Topology};

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    fn upload(mesh: &SimMesh, shape: &[usize], data: Vec<f32>, mapping: MeshMapping) -> SimTensor {
        SimBackend::from_host(
            mesh,
            shape,
            HostData::F32(data),
            TensorSpec::new(DType::F32).with_mapping(mapping),
        )
        .unwrap()
    }

    #[test]
    fn test_all_gather_replicates() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 4)).unwrap();
        let data: Vec<f32> = (0..8).map(|x| x as f32).collect();
        let t = upload(&mesh, &[1, 8], data.clone(), MeshMapping::Shard { dim: 1 });
        let g = SimBackend::all_gather(&t, 1, CollectiveParams::sync(Topology::Ring)).unwrap();
        assert_eq!(g.mapping(), MeshMapping::Replicate);
        assert_eq!(SimBackend::to_host_device(&g, 3).unwrap(), HostData::F32(data));
    }

    #[test]
    fn test_all_gather_wrong_dim_rejected() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let t = upload(&mesh, &[2, 2], vec![0.0; 4], MeshMapping::Shard { dim: 1 });
        assert!(SimBackend::all_gather(&t, 0, CollectiveParams::sync(Topology::Linear)).is_err());
    }

    #[test]
    fn test_reduce_scatter_sums_then_splits() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let t = upload(&mesh, &[1, 4], vec![1.0, 2.0, 3.0, 4.0], MeshMapping::Replicate);
        let r = SimBackend::reduce_scatter(&t, 1, CollectiveParams::sync(Topology::Linear)).unwrap();
        assert_eq!(r.local_shape(), &[1, 2]);
        assert_eq!(
            SimBackend::to_host_device(&r, 1).unwrap(),
            HostData::F32(vec![6.0, 8.0])
        );
    }

    #[test]
    fn test_async_collective_needs_reset_semaphore() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let cores = CoreRangeSet::single(CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1)));
        let sem = mesh.create_global_semaphore(&cores, 1).unwrap();
        let t = upload(&mesh, &[1, 2], vec![1.0, 1.0], MeshMapping::Replicate);
        let params = CollectiveParams {
            topology: Topology::Linear,
            semaphore: Some(&sem),
            sub_device: None,
        };
        assert!(SimBackend::all_reduce(&t, params).is_err());

        mesh.enable_persistent_fabric().unwrap();
        let stale = SimBackend::all_reduce(&t, params).unwrap();
        assert!(SimBackend::to_host(&stale).is_err());

        mesh.reset_global_semaphore(&sem, 0).unwrap();
        let ok = SimBackend::all_reduce(&t, params).unwrap();
        assert_eq!(SimBackend::to_host(&ok).unwrap(), HostData::F32(vec![2.0, 2.0]));
    }
}
