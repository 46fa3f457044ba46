//! EmbedOps implementation for SimBackend.

use meshinfer::backend::EmbedOps;
use meshinfer::dtype::DType;
use meshinfer::tensor::{Layout, MeshMapping, Tensor, TensorSpec};
use meshinfer::{Error, Result};

use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_dtype, require_float, require_rank, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

impl EmbedOps for SimBackend {
    fn embedding(indices: &SimTensor, weight: &SimTensor, layout: Layout) -> Result<SimTensor> {
        same_mesh(indices, weight)?;
        require_dtype(indices, DType::U32, "embedding")?;
        require_float(weight, "embedding")?;
        require_rank(weight, 2, "embedding")?;
        if indices.mapping() != MeshMapping::Replicate || weight.mapping() != MeshMapping::Replicate {
            return Err(Error::config("embedding expects replicated indices and table"));
        }
        let vocab = weight.shape()[0];
        let dim = weight.shape()[1];
        let mut out_shape = indices.shape().to_vec();
        out_shape.push(dim);
        let dtype = match (weight.dtype(), layout) {
            (DType::BFP8 | DType::BFP4, Layout::RowMajor) => DType::BF16,
            (dtype, _) => dtype,
        };
        let mesh = indices.mesh();
        let output = mesh.allocate(&out_shape, TensorSpec::new(dtype).with_layout(layout), "embedding")?;
        let (idx, table, dst) = (indices.id(), weight.id(), output.id());
        let devices = mesh.num_devices();
        let key = program_key("embedding", &[indices, weight], &format!("{layout:?}"));
        launch(mesh, "embedding", key, &[indices, weight, &output], move |mem| {
            for device in 0..devices {
                let ids = mem.u32(idx, device)?;
                let rows = mem.f32(table, device)?;
                let mut out = Vec::with_capacity(ids.len() * dim);
                for &token in ids {
                    let token = token as usize;
                    if token >= vocab {
                        return Err(Error::Device(format!(
                            "embedding index {token} out of range for vocab {vocab}"
                        )));
                    }
                    out.extend_from_slice(&rows[token * dim..(token + 1) * dim]);
                }
                quantize(dtype, &mut out);
                mem.store(dst, device, DeviceData::F32(out))?;
            }
            Ok(())
        })?;
        Ok(output)
    }
}
