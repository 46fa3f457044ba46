//! LayoutOps implementation: views, placement moves and data movement.

use meshinfer::backend::{LayoutOps, MeshControl};
use meshinfer::dtype::DType;
use meshinfer::mesh::MeshShape;
use meshinfer::tensor::{Layout, MemoryConfig, MeshMapping, Tensor};
use meshinfer::{Error, Result};

use crate::index;
use crate::memory::DeviceData;
use crate::ops::{launch, program_key, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

/// Where sharded dim `dim` of `old`, split into `parts`, lands after
/// reshaping to `new`, if every device's piece stays contiguous.
fn remap_shard_dim(old: &[usize], new: &[usize], dim: usize, parts: usize) -> Option<usize> {
    let tail: usize = old[dim..].iter().product();
    (0..new.len())
        .rev()
        .find(|&d| new[d] % parts == 0 && new[d..].iter().product::<usize>() == tail)
}

fn reshape_mapping(
    mapping: MeshMapping,
    old: &[usize],
    new: &[usize],
    mesh: MeshShape,
) -> Result<MeshMapping> {
    let remap = |dim: usize, parts: usize| {
        remap_shard_dim(old, new, dim, parts).ok_or_else(|| {
            Error::InvalidShape(format!(
                "reshape {old:?} -> {new:?} splits the sharded dim {dim}"
            ))
        })
    };
    Ok(match mapping {
        MeshMapping::Replicate => MeshMapping::Replicate,
        MeshMapping::Shard { dim } => MeshMapping::Shard {
            dim: remap(dim, mesh.num_devices())?,
        },
        MeshMapping::Shard2d { mesh_shape, dims } => MeshMapping::Shard2d {
            mesh_shape,
            dims: (
                dims.0.map(|d| remap(d, mesh_shape.rows)).transpose()?,
                dims.1.map(|d| remap(d, mesh_shape.cols)).transpose()?,
            ),
        },
    })
}

/// Sharded dims of a mapping.
pub(crate) fn sharded_dims(mapping: MeshMapping) -> Vec<usize> {
    match mapping {
        MeshMapping::Replicate => Vec::new(),
        MeshMapping::Shard { dim } => vec![dim],
        MeshMapping::Shard2d { dims, .. } => dims.0.into_iter().chain(dims.1).collect(),
    }
}

fn permute_mapping(mapping: MeshMapping, dims: &[usize]) -> MeshMapping {
    let moved = |old: usize| dims.iter().position(|&d| d == old).unwrap_or(old);
    match mapping {
        MeshMapping::Replicate => MeshMapping::Replicate,
        MeshMapping::Shard { dim } => MeshMapping::Shard { dim: moved(dim) },
        MeshMapping::Shard2d { mesh_shape, dims: d } => MeshMapping::Shard2d {
            mesh_shape,
            dims: (d.0.map(moved), d.1.map(moved)),
        },
    }
}

/// Copy a tensor into a new buffer with a different spec.
fn copy_with(input: &SimTensor, name: &'static str, layout: Layout, memory: MemoryConfig) -> Result<SimTensor> {
    let mesh = input.mesh();
    let spec = input.spec().with_layout(layout).with_memory(memory);
    let output = mesh.allocate(input.shape(), spec, name)?;
    let (src, dst) = (input.id(), output.id());
    let devices = mesh.num_devices();
    let key = program_key(name, &[input], &format!("{layout:?},{memory}"));
    launch(mesh, name, key, &[input, &output], move |mem| {
        for device in 0..devices {
            let data = mem.data(src, device)?.clone();
            mem.store(dst, device, data)?;
        }
        Ok(())
    })?;
    Ok(output)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn convert(data: &DeviceData, to: DType) -> Result<DeviceData> {
    Ok(match (data, to) {
        (DeviceData::F32(v), t) if t.is_float() => {
            let mut v = v.clone();
            quantize(t, &mut v);
            DeviceData::F32(v)
        }
        (DeviceData::F32(v), DType::I32) => DeviceData::I32(v.iter().map(|x| x.round() as i32).collect()),
        (DeviceData::F32(v), _) => DeviceData::U32(v.iter().map(|x| x.round().max(0.0) as u32).collect()),
        (DeviceData::I32(v), DType::I32) => DeviceData::I32(v.clone()),
        (DeviceData::I32(v), DType::U32) => {
            if let Some(neg) = v.iter().find(|&&x| x < 0) {
                return Err(Error::Device(format!("typecast of negative value {neg} to u32")));
            }
            DeviceData::U32(v.iter().map(|&x| x as u32).collect())
        }
        (DeviceData::I32(v), t) => {
            let mut f: Vec<f32> = v.iter().map(|&x| x as f32).collect();
            quantize(t, &mut f);
            DeviceData::F32(f)
        }
        (DeviceData::U32(v), DType::U32) => DeviceData::U32(v.clone()),
        (DeviceData::U32(v), DType::I32) => DeviceData::I32(v.iter().map(|&x| x as i32).collect()),
        (DeviceData::U32(v), t) => {
            let mut f: Vec<f32> = v.iter().map(|&x| x as f32).collect();
            quantize(t, &mut f);
            DeviceData::F32(f)
        }
    })
}

impl LayoutOps for SimBackend {
    fn reshape(input: &SimTensor, shape: &[usize]) -> Result<SimTensor> {
        let numel: usize = shape.iter().product();
        if numel != input.numel() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape {:?} ({} elements) to {shape:?}",
                input.shape(),
                input.numel()
            )));
        }
        let mesh_shape = input.mesh().shape();
        let mapping = reshape_mapping(input.mapping(), input.shape(), shape, mesh_shape)?;
        let spec = input.spec().with_mapping(mapping);
        spec.validate(shape, mesh_shape)?;
        let local = mapping.local_shape(shape, mesh_shape)?;
        Ok(input.view(shape.to_vec(), local, spec))
    }

    fn to_layout(input: &SimTensor, layout: Layout) -> Result<SimTensor> {
        if input.layout() == layout {
            return Ok(input.clone());
        }
        if layout == Layout::RowMajor && matches!(input.dtype(), DType::BFP8 | DType::BFP4) {
            return Err(Error::LayoutMismatch {
                expected: "tile layout for block-float dtypes".into(),
                got: format!("row-major {}", input.dtype()),
            });
        }
        let name = match layout {
            Layout::Tile => "tilize",
            Layout::RowMajor => "untilize",
        };
        copy_with(input, name, layout, input.memory_config())
    }

    fn to_memory_config(input: &SimTensor, memory: MemoryConfig) -> Result<SimTensor> {
        if input.memory_config() == memory {
            return Ok(input.clone());
        }
        copy_with(input, "to_memory_config", input.layout(), memory)
    }

    fn typecast(input: &SimTensor, dtype: DType) -> Result<SimTensor> {
        let mesh = input.mesh();
        let output = mesh.allocate(input.shape(), input.spec().with_dtype(dtype), "typecast")?;
        let (src, dst) = (input.id(), output.id());
        let devices = mesh.num_devices();
        let key = program_key("typecast", &[input], &dtype.to_string());
        launch(mesh, "typecast", key, &[input, &output], move |mem| {
            for device in 0..devices {
                let converted = convert(mem.data(src, device)?, dtype)?;
                mem.store(dst, device, converted)?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn slice(input: &SimTensor, dim: usize, start: usize, end: usize) -> Result<SimTensor> {
        let shape = input.shape();
        if dim >= shape.len() || start >= end || end > shape[dim] {
            return Err(Error::InvalidShape(format!(
                "slice {start}..{end} of dim {dim} out of range for {shape:?}"
            )));
        }
        if sharded_dims(input.mapping()).contains(&dim) {
            return Err(Error::InvalidShape(format!(
                "cannot slice along sharded dim {dim}"
            )));
        }
        let mut out_shape = shape.to_vec();
        out_shape[dim] = end - start;
        let memory = match input.memory_config() {
            MemoryConfig::L1Sharded(_) => MemoryConfig::L1,
            other => other,
        };
        let mesh = input.mesh();
        let output = mesh.allocate(&out_shape, input.spec().with_memory(memory), "slice")?;
        let (src, dst) = (input.id(), output.id());
        let local = input.local_shape().to_vec();
        let devices = mesh.num_devices();
        let key = program_key("slice", &[input], &format!("{dim},{start},{end}"));
        launch(mesh, "slice", key, &[input, &output], move |mem| {
            let mut ranges: Vec<_> = local.iter().map(|&d| 0..d).collect();
            ranges[dim] = start..end;
            for device in 0..devices {
                let piece = mem.data(src, device)?.gather(&local, &ranges);
                mem.store(dst, device, piece)?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn concat(inputs: &[&SimTensor], dim: usize) -> Result<SimTensor> {
        let Some(first) = inputs.first() else {
            return Err(Error::InvalidShape("concat of zero tensors".into()));
        };
        if dim >= first.ndim() || sharded_dims(first.mapping()).contains(&dim) {
            return Err(Error::InvalidShape(format!(
                "cannot concat {:?} along dim {dim}",
                first.shape()
            )));
        }
        let mut out_shape = first.shape().to_vec();
        out_shape[dim] = 0;
        for t in inputs {
            same_mesh(first, t)?;
            let mut expected = first.shape().to_vec();
            expected[dim] = t.shape().get(dim).copied().unwrap_or(0);
            if t.shape() != expected.as_slice() || t.dtype() != first.dtype() || t.mapping() != first.mapping() {
                return Err(Error::ShapeMismatch {
                    expected,
                    got: t.shape().to_vec(),
                });
            }
            out_shape[dim] += t.shape()[dim];
        }
        let mesh = first.mesh();
        let spec = first.spec().with_memory(MemoryConfig::Dram);
        let output = mesh.allocate(&out_shape, spec, "concat")?;
        let parts: Vec<(u64, Vec<usize>)> = inputs.iter().map(|t| (t.id(), t.local_shape().to_vec())).collect();
        let out_local = output.local_shape().to_vec();
        let dst = output.id();
        let devices = mesh.num_devices();
        let key = program_key("concat", inputs, &dim.to_string());
        let mut tensors: Vec<&SimTensor> = inputs.to_vec();
        tensors.push(&output);
        launch(mesh, "concat", key, &tensors, move |mem| {
            for device in 0..devices {
                let mut out = mem.data(dst, device)?.clone();
                let mut offset = 0;
                for (id, local) in &parts {
                    let mut ranges: Vec<_> = out_local.iter().map(|&d| 0..d).collect();
                    ranges[dim] = offset..offset + local[dim];
                    out.scatter(&out_local, &ranges, mem.data(*id, device)?)?;
                    offset += local[dim];
                }
                mem.store(dst, device, out)?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn permute(input: &SimTensor, dims: &[usize]) -> Result<SimTensor> {
        let rank = input.ndim();
        let mut seen = vec![false; rank];
        for &d in dims {
            if d >= rank || std::mem::replace(&mut seen[d], true) {
                return Err(Error::InvalidShape(format!(
                    "{dims:?} is not a permutation of {rank} dims"
                )));
            }
        }
        if dims.len() != rank {
            return Err(Error::InvalidShape(format!(
                "{dims:?} is not a permutation of {rank} dims"
            )));
        }
        let out_shape: Vec<usize> = dims.iter().map(|&d| input.shape()[d]).collect();
        let mapping = permute_mapping(input.mapping(), dims);
        let spec = input
            .spec()
            .with_mapping(mapping)
            .with_memory(MemoryConfig::Dram);
        let mesh = input.mesh();
        let output = mesh.allocate(&out_shape, spec, "permute")?;
        let (src, dst) = (input.id(), output.id());
        let local = input.local_shape().to_vec();
        let order = dims.to_vec();
        let devices = mesh.num_devices();
        let key = program_key("permute", &[input], &format!("{dims:?}"));
        launch(mesh, "permute", key, &[input, &output], move |mem| {
            for device in 0..devices {
                let permuted = match mem.data(src, device)? {
                    DeviceData::F32(v) => DeviceData::F32(index::permute(v, &local, &order)),
                    DeviceData::I32(v) => DeviceData::I32(index::permute(v, &local, &order)),
                    DeviceData::U32(v) => DeviceData::U32(index::permute(v, &local, &order)),
                };
                mem.store(dst, device, permuted)?;
            }
            Ok(())
        })?;
        Ok(output)
    }
}
