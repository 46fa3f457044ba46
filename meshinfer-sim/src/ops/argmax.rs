//! ArgmaxOps implementation for SimBackend.

use meshinfer::backend::ArgmaxOps;
use meshinfer::dtype::DType;
use meshinfer::sampling;
use meshinfer::tensor::{Layout, MeshMapping, Tensor};
use meshinfer::{Error, Result};

use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_dtype, require_float, same_mesh};
use crate::tensor::SimTensor;
use crate::SimBackend;

impl ArgmaxOps for SimBackend {
    fn argmax_into(input: &SimTensor, output: &SimTensor) -> Result<()> {
        same_mesh(input, output)?;
        require_float(input, "argmax")?;
        require_dtype(output, DType::U32, "argmax output")?;
        if input.layout() != Layout::RowMajor {
            return Err(Error::LayoutMismatch {
                expected: "row-major argmax input".into(),
                got: format!("{:?}", input.layout()),
            });
        }
        if input.mapping() != MeshMapping::Replicate || output.mapping() != MeshMapping::Replicate {
            return Err(Error::config("argmax needs replicated input and output"));
        }
        let width = *input.shape().last().unwrap_or(&0);
        if width == 0 || input.numel() / width != output.numel() {
            return Err(Error::InvalidShape(format!(
                "argmax of {:?} cannot fill output {:?}",
                input.shape(),
                output.shape()
            )));
        }
        let mesh = input.mesh();
        let (src, dst) = (input.id(), output.id());
        let devices = mesh.num_devices();
        let key = program_key("argmax", &[input, output], "");
        launch(mesh, "argmax", key, &[input, output], move |mem| {
            for device in 0..devices {
                let ids: Vec<u32> = mem
                    .f32(src, device)?
                    .chunks_exact(width)
                    .map(sampling::argmax)
                    .collect();
                mem.store(dst, device, DeviceData::U32(ids))?;
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

    #[test]
    fn test_argmax_rows_ties_lowest() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let logits = SimBackend::from_host(
            &mesh,
            &[1, 1, 2, 3],
            HostData::F32(vec![0.1, 0.9, 0.2, 5.0, 1.0, 5.0]),
            TensorSpec::new(DType::F32).row_major(),
        )
        .unwrap();
        let out = SimBackend::zeros(&mesh, &[2], TensorSpec::new(DType::U32).row_major()).unwrap();
        SimBackend::argmax_into(&logits, &out).unwrap();
        assert_eq!(SimBackend::to_host(&out).unwrap(), HostData::U32(vec![1, 0]));
    }

    #[test]
    fn test_tiled_input_rejected() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let logits = SimBackend::zeros(&mesh, &[1, 4], TensorSpec::new(DType::BF16)).unwrap();
        let out = SimBackend::zeros(&mesh, &[1], TensorSpec::new(DType::U32).row_major()).unwrap();
        assert!(SimBackend::argmax_into(&logits, &out).is_err());
    }
}
