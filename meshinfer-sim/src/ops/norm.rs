//! NormOps implementation for SimBackend.

use meshinfer::backend::NormOps;
use meshinfer::tensor::{MeshMapping, Tensor};
use meshinfer::{Error, Result};

use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_float, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

#[allow(clippy::cast_precision_loss)]
fn rms_norm_row(row: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / row.len() as f32;
    let scale = 1.0 / (mean_sq + eps).sqrt();
    for ((o, x), w) in out.iter_mut().zip(row).zip(weight) {
        *o = x * scale * w;
    }
}

impl NormOps for SimBackend {
    fn rms_norm(input: &SimTensor, weight: &SimTensor, eps: f32) -> Result<SimTensor> {
        same_mesh(input, weight)?;
        require_float(input, "rms_norm")?;
        require_float(weight, "rms_norm")?;
        let hidden = *input.local_shape().last().unwrap_or(&0);
        if hidden == 0 || weight.mapping() != MeshMapping::Replicate || weight.numel() != hidden {
            return Err(Error::InvalidShape(format!(
                "rms_norm weight {:?} does not match hidden size {hidden}",
                weight.shape()
            )));
        }
        let mesh = input.mesh();
        let output = mesh.allocate(input.shape(), *input.spec(), "rms_norm")?;
        let (src, w, dst) = (input.id(), weight.id(), output.id());
        let dtype = input.dtype();
        let devices = mesh.num_devices();
        let key = program_key("rms_norm", &[input, weight], "");
        launch(mesh, "rms_norm", key, &[input, weight, &output], move |mem| {
            for device in 0..devices {
                let x = mem.f32(src, device)?;
                let gamma = mem.f32(w, device)?;
                let mut out = vec![0.0_f32; x.len()];
                for (row, row_out) in x.chunks_exact(hidden).zip(out.chunks_exact_mut(hidden)) {
                    rms_norm_row(row, gamma, eps, row_out);
                }
                quantize(dtype, &mut out);
                mem.store(dst, device, DeviceData::F32(out))?;
            }
            Ok(())
        })?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::backend::TensorIo;
    use meshinfer::dtype::DType;
    use meshinfer::host::HostData;
    use meshinfer::tensor::TensorSpec;

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    #[test]
    fn test_rms_norm_unit_rows() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let x = SimBackend::from_host(
            &mesh,
            &[1, 1, 2, 2],
            HostData::F32(vec![3.0, 4.0, -2.0, 2.0]),
            TensorSpec::new(DType::F32),
        )
        .unwrap();
        let w = SimBackend::from_host(
            &mesh,
            &[2],
            HostData::F32(vec![1.0, 2.0]),
            TensorSpec::new(DType::F32),
        )
        .unwrap();
        let y = SimBackend::rms_norm(&x, &w, 0.0).unwrap();
        let HostData::F32(v) = SimBackend::to_host(&y).unwrap() else {
            panic!("expected f32");
        };
        let rms0 = (12.5_f32).sqrt();
        assert!((v[0] - 3.0 / rms0).abs() < 1e-5);
        assert!((v[1] - 8.0 / rms0).abs() < 1e-5);
        assert!((v[2] + 1.0).abs() < 1e-5);
        assert!((v[3] - 2.0).abs() < 1e-5);
    }
}
