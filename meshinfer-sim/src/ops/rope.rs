//! RopeOps implementation for SimBackend.

use meshinfer::backend::RopeOps;
use meshinfer::tensor::{MeshMapping, Tensor};
use meshinfer::{Error, Result};

use crate::index::broadcast_offsets;
use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_float, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

fn check_broadcast(x: &[usize], table: &SimTensor, what: &str) -> Result<()> {
    let shape = table.shape();
    let ok = shape.len() == x.len()
        && shape.last() == x.last()
        && shape.iter().zip(x).all(|(&t, &d)| t == d || t == 1);
    if !ok || table.mapping() != MeshMapping::Replicate {
        return Err(Error::InvalidShape(format!(
            "rotary {what} {shape:?} does not broadcast to {x:?}"
        )));
    }
    Ok(())
}

impl RopeOps for SimBackend {
    fn rotary_embedding(
        input: &SimTensor,
        cos: &SimTensor,
        sin: &SimTensor,
        trans_mat: &SimTensor,
    ) -> Result<SimTensor> {
        for t in [cos, sin, trans_mat] {
            same_mesh(input, t)?;
            require_float(t, "rotary_embedding")?;
        }
        require_float(input, "rotary_embedding")?;
        let local = input.local_shape().to_vec();
        let head_dim = *local.last().unwrap_or(&0);
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(Error::InvalidShape(format!(
                "rotary input {:?} needs an even, non-empty head dim",
                input.shape()
            )));
        }
        check_broadcast(&local, cos, "cos")?;
        check_broadcast(&local, sin, "sin")?;
        let t_shape = trans_mat.shape();
        if trans_mat.numel() != head_dim * head_dim
            || t_shape[t_shape.len() - 1] != head_dim
            || trans_mat.mapping() != MeshMapping::Replicate
        {
            return Err(Error::InvalidShape(format!(
                "rotation matrix {t_shape:?} does not match head dim {head_dim}"
            )));
        }

        let offsets = broadcast_offsets(&local, cos.shape());
        let mesh = input.mesh();
        let output = mesh.allocate(input.shape(), *input.spec(), "rotary_embedding")?;
        let (x_id, cos_id, sin_id, t_id, dst) =
            (input.id(), cos.id(), sin.id(), trans_mat.id(), output.id());
        let dtype = input.dtype();
        let devices = mesh.num_devices();
        let key = program_key("rotary_embedding", &[input, cos, sin, trans_mat], "");
        launch(
            mesh,
            "rotary_embedding",
            key,
            &[input, cos, sin, trans_mat, &output],
            move |mem| {
                for device in 0..devices {
                    let x = mem.f32(x_id, device)?;
                    let c = mem.f32(cos_id, device)?;
                    let s = mem.f32(sin_id, device)?;
                    let t = mem.f32(t_id, device)?;
                    let mut out = vec![0.0_f32; x.len()];
                    for (row, out_row) in x.chunks_exact(head_dim).zip(out.chunks_exact_mut(head_dim)) {
                        for (j, o) in out_row.iter_mut().enumerate() {
                            *o = row.iter().enumerate().map(|(i, v)| v * t[i * head_dim + j]).sum();
                        }
                    }
                    for (i, o) in out.iter_mut().enumerate() {
                        let off = offsets[i];
                        *o = x[i] * c[off] + *o * s[off];
                    }
                    quantize(dtype, &mut out);
                    mem.store(dst, device, DeviceData::F32(out))?;
                }
                Ok(())
            },
        )?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::backend::TensorIo;
    use meshinfer::dtype::DType;
    use meshinfer::host::HostData;
    use meshinfer::rope;
    use meshinfer::tensor::TensorSpec;

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    fn upload(mesh: &SimMesh, shape: &[usize], data: Vec<f32>) -> SimTensor {
        SimBackend::from_host(mesh, shape, HostData::F32(data), TensorSpec::new(DType::F32)).unwrap()
    }

    #[test]
    fn test_quarter_turn() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        // head_dim 2: rotating (1, 0) by 90 degrees gives (0, 1)
        let x = upload(&mesh, &[1, 1, 1, 2], vec![1.0, 0.0]);
        let cos = upload(&mesh, &[1, 1, 1, 2], vec![0.0, 0.0]);
        let sin = upload(&mesh, &[1, 1, 1, 2], vec![1.0, 1.0]);
        let t = upload(&mesh, &[1, 1, 2, 2], rope::rotation_matrix(2));
        let y = SimBackend::rotary_embedding(&x, &cos, &sin, &t).unwrap();
        assert_eq!(SimBackend::to_host(&y).unwrap(), HostData::F32(vec![0.0, 1.0]));
    }

    #[test]
    fn test_broadcast_over_heads() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let x = upload(&mesh, &[1, 2, 1, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let cos = upload(&mesh, &[1, 1, 1, 2], vec![1.0, 1.0]);
        let sin = upload(&mesh, &[1, 1, 1, 2], vec![0.0, 0.0]);
        let t = upload(&mesh, &[1, 1, 2, 2], rope::rotation_matrix(2));
        let y = SimBackend::rotary_embedding(&x, &cos, &sin, &t).unwrap();
        assert_eq!(
            SimBackend::to_host(&y).unwrap(),
            HostData::F32(vec![1.0, 0.0, 0.0, 1.0])
        );

        let bad_cos = upload(&mesh, &[1, 1, 2, 2], vec![0.0; 4]);
        let bad_x = upload(&mesh, &[1, 1, 3, 2], vec![0.0; 6]);
        assert!(SimBackend::rotary_embedding(&bad_x, &bad_cos, &bad_cos, &t).is_err());
    }
}
