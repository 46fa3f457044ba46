//! ArithOps implementation for SimBackend.

use meshinfer::backend::ArithOps;
use meshinfer::dtype::DType;
use meshinfer::tensor::Tensor;
use meshinfer::{Error, Result};

use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_dtype, require_float, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn binary(
    name: &'static str,
    a: &SimTensor,
    b: &SimTensor,
    f: fn(f32, f32) -> f32,
) -> Result<SimTensor> {
    same_mesh(a, b)?;
    require_float(a, name)?;
    require_float(b, name)?;
    if a.shape() != b.shape() || a.mapping() != b.mapping() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    let mesh = a.mesh();
    let output = mesh.allocate(a.shape(), *a.spec(), name)?;
    let (lhs, rhs, dst) = (a.id(), b.id(), output.id());
    let dtype = a.dtype();
    let devices = mesh.num_devices();
    let key = program_key(name, &[a, b], "");
    launch(mesh, name, key, &[a, b, &output], move |mem| {
        for device in 0..devices {
            let x = mem.f32(lhs, device)?;
            let y = mem.f32(rhs, device)?;
            let mut out: Vec<f32> = x.iter().zip(y).map(|(&p, &q)| f(p, q)).collect();
            quantize(dtype, &mut out);
            mem.store(dst, device, DeviceData::F32(out))?;
        }
        Ok(())
    })?;
    Ok(output)
}

impl ArithOps for SimBackend {
    fn add(a: &SimTensor, b: &SimTensor) -> Result<SimTensor> {
        binary("add", a, b, |p, q| p + q)
    }

    fn mul(a: &SimTensor, b: &SimTensor) -> Result<SimTensor> {
        binary("mul", a, b, |p, q| p * q)
    }

    fn silu(input: &SimTensor) -> Result<SimTensor> {
        require_float(input, "silu")?;
        let mesh = input.mesh();
        let output = mesh.allocate(input.shape(), *input.spec(), "silu")?;
        let (src, dst) = (input.id(), output.id());
        let dtype = input.dtype();
        let devices = mesh.num_devices();
        let key = program_key("silu", &[input], "");
        launch(mesh, "silu", key, &[input, &output], move |mem| {
            for device in 0..devices {
                let mut out: Vec<f32> = mem.f32(src, device)?.iter().map(|&x| silu(x)).collect();
                quantize(dtype, &mut out);
                mem.store(dst, device, DeviceData::F32(out))?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn plus_one(tensor: &SimTensor) -> Result<()> {
        require_dtype(tensor, DType::I32, "plus_one")?;
        let mesh = tensor.mesh();
        let id = tensor.id();
        let devices = mesh.num_devices();
        let key = program_key("plus_one", &[tensor], "");
        launch(mesh, "plus_one", key, &[tensor], move |mem| {
            for device in 0..devices {
                for v in mem.i32_mut(id, device)?.iter_mut() {
                    *v += 1;
                }
            }
            Ok(())
        })
    }

    fn fill_zero(tensor: &SimTensor) -> Result<()> {
        let mesh = tensor.mesh();
        let id = tensor.id();
        let dtype = tensor.dtype();
        let len = tensor.local_numel();
        let devices = mesh.num_devices();
        let key = program_key("fill_zero", &[tensor], "");
        launch(mesh, "fill_zero", key, &[tensor], move |mem| {
            for device in 0..devices {
                mem.store(id, device, DeviceData::zeros(dtype, len))?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::backend::TensorIo;
    use meshinfer::host::HostData;
    use meshinfer::tensor::TensorSpec;

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    fn floats(mesh: &SimMesh, data: Vec<f32>) -> SimTensor {
        let n = data.len();
        SimBackend::from_host(mesh, &[n], HostData::F32(data), TensorSpec::new(DType::F32)).unwrap()
    }

    #[test]
    fn test_add_mul_silu() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let a = floats(&mesh, vec![1.0, -2.0]);
        let b = floats(&mesh, vec![3.0, 4.0]);
        let sum = SimBackend::add(&a, &b).unwrap();
        let prod = SimBackend::mul(&a, &b).unwrap();
        assert_eq!(SimBackend::to_host(&sum).unwrap(), HostData::F32(vec![4.0, 2.0]));
        assert_eq!(SimBackend::to_host(&prod).unwrap(), HostData::F32(vec![3.0, -8.0]));
        let s = SimBackend::silu(&floats(&mesh, vec![0.0])).unwrap();
        assert_eq!(SimBackend::to_host(&s).unwrap(), HostData::F32(vec![0.0]));
    }

    #[test]
    fn test_plus_one_only_on_i32() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let pos = SimBackend::from_host(
            &mesh,
            &[2],
            HostData::I32(vec![5, 9]),
            TensorSpec::new(DType::I32).row_major(),
        )
        .unwrap();
        SimBackend::plus_one(&pos).unwrap();
        SimBackend::plus_one(&pos).unwrap();
        assert_eq!(SimBackend::to_host(&pos).unwrap(), HostData::I32(vec![7, 11]));

        let ids = SimBackend::zeros(&mesh, &[2], TensorSpec::new(DType::U32).row_major()).unwrap();
        let err = SimBackend::plus_one(&ids).unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_fill_zero_in_place() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let a = floats(&mesh, vec![1.0, 2.0]);
        SimBackend::fill_zero(&a).unwrap();
        assert_eq!(SimBackend::to_host(&a).unwrap(), HostData::F32(vec![0.0, 0.0]));
    }
}
