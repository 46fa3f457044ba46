//! MatmulOps implementation for SimBackend.
//!
//! All matmul is f32 row-major `A (M,K) × B (K,N) → C (M,N)` on each
//! device's local pieces. B is transposed once so every output element is a
//! contiguous dot product; output rows are parallelized with Rayon.
//!
//! How the operands are distributed decides what the output is:
//!
//! | input              | weight             | output                        |
//! |--------------------|--------------------|-------------------------------|
//! | replicated         | replicated         | replicated                    |
//! | replicated         | sharded along N    | sharded along the last dim    |
//! | sharded along K    | sharded along K    | per-device partial sums       |
//!
//! Partial sums are tagged replicated and must go through `all_reduce`.

use meshinfer::backend::{Activation, MatmulConfig, MatmulOps};
use meshinfer::tensor::{Layout, MemoryConfig, MeshMapping, Tensor, TensorSpec};
use meshinfer::{Error, Result};
use rayon::prelude::*;

use crate::memory::DeviceData;
use crate::ops::{launch, program_key, require_float, same_mesh};
use crate::quant::{apply_fidelity, quantize};
use crate::tensor::SimTensor;
use crate::SimBackend;

/// Transpose `B (K,N)` → `Bᵀ (N,K)` in row-major order.
#[allow(clippy::many_single_char_names)]
fn transpose(b: &[f32], k: usize, n: usize) -> Vec<f32> {
    let mut bt = vec![0.0f32; n * k];
    for row in 0..k {
        for col in 0..n {
            bt[col * k + row] = b[row * n + col];
        }
    }
    bt
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[allow(clippy::many_single_char_names)]
fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let bt = transpose(b, k, n);
    let mut c = vec![0.0f32; m * n];
    if n == 0 {
        return c;
    }
    c.par_chunks_mut(n).enumerate().for_each(|(row, c_row)| {
        let a_row = &a[row * k..(row + 1) * k];
        for (col, out) in c_row.iter_mut().enumerate() {
            *out = dot(a_row, &bt[col * k..(col + 1) * k]);
        }
    });
    c
}

fn output_mapping(input: &SimTensor, weight: &SimTensor) -> Result<MeshMapping> {
    let in_last = input.ndim() - 1;
    let w_rank = weight.ndim();
    match (input.mapping(), weight.mapping()) {
        (MeshMapping::Replicate, MeshMapping::Replicate) => Ok(MeshMapping::Replicate),
        (MeshMapping::Replicate, MeshMapping::Shard { dim }) if dim == w_rank - 1 => {
            Ok(MeshMapping::Shard { dim: in_last })
        }
        (MeshMapping::Shard { dim: a }, MeshMapping::Shard { dim: b })
            if a == in_last && b == w_rank - 2 =>
        {
            Ok(MeshMapping::Replicate)
        }
        (MeshMapping::Shard { dim }, MeshMapping::Replicate) if dim < in_last => {
            Ok(MeshMapping::Shard { dim })
        }
        (i, w) => Err(Error::config(format!(
            "linear does not support input mapping {i:?} with weight mapping {w:?}"
        ))),
    }
}

impl MatmulOps for SimBackend {
    fn linear(input: &SimTensor, weight: &SimTensor, config: &MatmulConfig) -> Result<SimTensor> {
        same_mesh(input, weight)?;
        require_float(input, "linear")?;
        require_float(weight, "linear")?;
        let w_shape = weight.shape();
        let w_rank = w_shape.len();
        if w_rank < 2 || w_shape[..w_rank - 2].iter().any(|&d| d != 1) {
            return Err(Error::InvalidShape(format!(
                "linear weight must be [1, 1, K, N], got {w_shape:?}"
            )));
        }
        let (k, n) = (w_shape[w_rank - 2], w_shape[w_rank - 1]);
        let i_shape = input.shape();
        if i_shape.last() != Some(&k) {
            return Err(Error::ShapeMismatch {
                expected: vec![k],
                got: i_shape.to_vec(),
            });
        }
        let mapping = output_mapping(input, weight)?;

        let local_in = input.local_shape();
        let local_w = weight.local_shape();
        let lk = local_w[w_rank - 2];
        let ln = local_w[w_rank - 1];
        if local_in.last() != Some(&lk) {
            return Err(Error::ShapeMismatch {
                expected: vec![lk],
                got: local_in.to_vec(),
            });
        }
        let m: usize = local_in[..local_in.len() - 1].iter().product();

        let mut out_shape = i_shape[..i_shape.len() - 1].to_vec();
        out_shape.push(n);
        let dtype = config.output_dtype.unwrap_or(input.dtype());
        let spec = TensorSpec {
            dtype,
            layout: Layout::Tile,
            memory: config.memory.unwrap_or(MemoryConfig::Dram),
            mapping,
        };
        let mesh = input.mesh();
        let output = mesh.allocate(&out_shape, spec, "linear")?;

        let (a, b, dst) = (input.id(), weight.id(), output.id());
        let devices = mesh.num_devices();
        let cfg = *config;
        let key = program_key("linear", &[input, weight], &format!("{cfg:?}"));
        launch(mesh, "linear", key, &[input, weight, &output], move |mem| {
            for device in 0..devices {
                let mut x = mem.f32(a, device)?.to_vec();
                apply_fidelity(cfg.fidelity, &mut x);
                let mut c = gemm(&x, mem.f32(b, device)?, m, lk, ln);
                if let Some(Activation::Silu) = cfg.activation {
                    for v in &mut c {
                        *v /= 1.0 + (-*v).exp();
                    }
                }
                quantize(dtype, &mut c);
                mem.store(dst, device, DeviceData::F32(c))?;
            }
            Ok(())
        })?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::backend::{CollectiveOps, MathFidelity, TensorIo};
    use meshinfer::dtype::DType;
    use meshinfer::host::HostData;
    use meshinfer::mesh::{CollectiveParams, Topology};

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    const EXACT: MatmulConfig = MatmulConfig {
        fidelity: MathFidelity::HiFi4,
        activation: None,
        output_dtype: None,
        memory: None,
    };

    fn upload(mesh: &SimMesh, shape: &[usize], data: Vec<f32>, mapping: MeshMapping) -> SimTensor {
        SimBackend::from_host(
            mesh,
            shape,
            HostData::F32(data),
            TensorSpec::new(DType::F32).with_mapping(mapping),
        )
        .unwrap()
    }

    fn host(t: &SimTensor) -> Vec<f32> {
        SimBackend::to_host(t).unwrap().into_f32().unwrap()
    }

    #[test]
    fn test_gemm() {
        // [1,2] x [2,3]
        let c = gemm(&[1.0, 2.0], &[1.0, 0.0, 2.0, 0.0, 1.0, 3.0], 1, 2, 3);
        assert_eq!(c, vec![1.0, 2.0, 8.0]);
    }

    #[test]
    fn test_column_sharded_weight_shards_output() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let x = upload(&mesh, &[1, 1, 1, 2], vec![1.0, 2.0], MeshMapping::Replicate);
        let w = upload(
            &mesh,
            &[1, 1, 2, 4],
            vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0],
            MeshMapping::Shard { dim: 3 },
        );
        let y = SimBackend::linear(&x, &w, &EXACT).unwrap();
        assert_eq!(y.mapping(), MeshMapping::Shard { dim: 3 });
        assert_eq!(host(&y), vec![1.0, 2.0, 2.0, 3.0]);
    }

    #[test]
    fn test_row_sharded_weight_needs_all_reduce() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let x = upload(&mesh, &[1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0], MeshMapping::Shard { dim: 3 });
        let w = upload(&mesh, &[1, 1, 4, 1], vec![1.0, 1.0, 1.0, 1.0], MeshMapping::Shard { dim: 2 });
        let partial = SimBackend::linear(&x, &w, &EXACT).unwrap();
        // device 0 saw 1 + 2, device 1 saw 3 + 4
        assert_eq!(SimBackend::to_host_device(&partial, 1).unwrap(), HostData::F32(vec![7.0]));
        let full = SimBackend::all_reduce(&partial, CollectiveParams::sync(Topology::Linear)).unwrap();
        assert_eq!(host(&full), vec![10.0]);
    }

    #[test]
    fn test_fused_silu_and_output_dtype() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let x = upload(&mesh, &[1, 1], vec![0.0], MeshMapping::Replicate);
        let w = upload(&mesh, &[1, 1], vec![1.0], MeshMapping::Replicate);
        let cfg = MatmulConfig {
            activation: Some(Activation::Silu),
            output_dtype: Some(DType::BF16),
            ..EXACT
        };
        let y = SimBackend::linear(&x, &w, &cfg).unwrap();
        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(host(&y), vec![0.0]);
    }

    #[test]
    fn test_mismatched_inner_dim_rejected() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let x = upload(&mesh, &[1, 3], vec![0.0; 3], MeshMapping::Replicate);
        let w = upload(&mesh, &[1, 1, 2, 2], vec![0.0; 4], MeshMapping::Replicate);
        assert!(SimBackend::linear(&x, &w, &EXACT).is_err());
    }
}
