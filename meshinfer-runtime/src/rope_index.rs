//! Rotary position tables and the per-step rotation index.
//!
//! The cos/sin tables live on device as `[table_len, head_dim]` rows with
//! both halves duplicated. Decode never uploads gathered rows: the host
//! stages an `I32` index per user, the transfer queue copies it into a
//! trace-bound tensor, and the trace body gathers the rows with an
//! embedding lookup after a cast to `U32`.

use meshinfer::rope::{duplicate_halves, precompute, rotation_matrix};
use meshinfer::{
    DType, Error, HostData, KernelRuntime, Layout, ModelArgs, Result, Tensor, TensorSpec,
};

/// Rotation indices either staged on the host or already on device.
pub enum RotIdxs<T> {
    Host(Vec<i32>),
    Device(T),
}

impl<T> RotIdxs<T> {
    /// Host payload for a `copy_host_to_device`.
    ///
    /// # Errors
    /// Returns an error for indices that were already uploaded.
    pub fn into_host(self) -> Result<HostData> {
        match self {
            Self::Host(idxs) => Ok(HostData::I32(idxs)),
            Self::Device(_) => Err(Error::Other("rotation indices are already on device".into())),
        }
    }
}

/// Device-resident RoPE tables for one model.
pub struct RopeIndex<B: KernelRuntime> {
    mesh: B::Mesh,
    head_dim: usize,
    table_len: usize,
    host_cos: Vec<f32>,
    host_sin: Vec<f32>,
    cos_table: B::Tensor,
    sin_table: B::Tensor,
    trans_mat: B::Tensor,
}

/// Rows in the device tables. Padded prefill lengths are powers of two of
/// at least 128, so this always covers the longest padded prompt.
#[must_use]
pub fn table_len(max_seq_len: usize) -> usize {
    max_seq_len.next_power_of_two().max(128)
}

impl<B: KernelRuntime> RopeIndex<B> {
    /// Precompute and upload the tables for `args`.
    ///
    /// # Errors
    /// Returns an error if an upload does not fit on the mesh.
    pub fn new(mesh: &B::Mesh, args: &ModelArgs) -> Result<Self> {
        let head_dim = args.head_dim;
        let table_len = table_len(args.max_seq_len);
        let (cos, sin) = precompute(
            head_dim,
            table_len,
            args.rope_theta,
            args.effective_rope_scaling(),
        );
        let host_cos = duplicate_halves(&cos, head_dim);
        let host_sin = duplicate_halves(&sin, head_dim);
        let spec = TensorSpec::new(DType::F32);
        let cos_table = B::from_host(mesh, &[table_len, head_dim], HostData::F32(host_cos.clone()), spec)?;
        let sin_table = B::from_host(mesh, &[table_len, head_dim], HostData::F32(host_sin.clone()), spec)?;
        let trans_mat = B::from_host(
            mesh,
            &[1, 1, head_dim, head_dim],
            HostData::F32(rotation_matrix(head_dim)),
            spec,
        )?;
        log::debug!(
            "RoPE tables: {table_len} positions x {head_dim}, theta {}{}",
            args.rope_theta,
            if args.effective_rope_scaling().is_some() { ", scaled" } else { "" }
        );
        Ok(Self {
            mesh: mesh.clone(),
            head_dim,
            table_len,
            host_cos,
            host_sin,
            cos_table,
            sin_table,
            trans_mat,
        })
    }

    #[must_use]
    pub fn table_len(&self) -> usize {
        self.table_len
    }

    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[allow(clippy::cast_sign_loss)]
    fn check_positions(&self, current_pos: &[i32]) -> Result<()> {
        if let Some(&bad) = current_pos
            .iter()
            .find(|&&p| p < 0 || p as usize >= self.table_len)
        {
            return Err(Error::config(format!(
                "position {bad} outside the RoPE table of {} rows",
                self.table_len
            )));
        }
        Ok(())
    }

    /// Gather the rows for `current_pos` on the host and upload them as
    /// `[1, B, 1, head_dim]` cos and sin.
    ///
    /// # Errors
    /// Returns a configuration error for a position outside the table.
    #[allow(clippy::cast_sign_loss)]
    pub fn get_rot_mats(&self, current_pos: &[i32]) -> Result<(B::Tensor, B::Tensor)> {
        self.check_positions(current_pos)?;
        let hd = self.head_dim;
        let gather = |table: &[f32]| -> Vec<f32> {
            current_pos
                .iter()
                .flat_map(|&p| {
                    let p = p as usize;
                    table[p * hd..(p + 1) * hd].iter().copied()
                })
                .collect()
        };
        let shape = [1, current_pos.len(), 1, hd];
        let spec = TensorSpec::new(DType::F32);
        Ok((
            B::from_host(&self.mesh, &shape, HostData::F32(gather(&self.host_cos)), spec)?,
            B::from_host(&self.mesh, &shape, HostData::F32(gather(&self.host_sin)), spec)?,
        ))
    }

    /// Rotation indices for `current_pos`, one per user.
    ///
    /// With `on_host` the indices are only staged for a later
    /// `copy_host_to_device` into a trace-bound tensor. Otherwise they are
    /// uploaded as a new `[1, B]` row-major `I32` tensor.
    ///
    /// # Errors
    /// Returns an error if the upload fails.
    pub fn get_rot_idxs(&self, current_pos: &[i32], on_host: bool) -> Result<RotIdxs<B::Tensor>> {
        let idxs = current_pos.to_vec();
        if on_host {
            return Ok(RotIdxs::Host(idxs));
        }
        self.check_positions(current_pos)?;
        let device = B::from_host(
            &self.mesh,
            &[1, idxs.len()],
            HostData::I32(idxs),
            TensorSpec::new(DType::I32).row_major(),
        )?;
        Ok(RotIdxs::Device(device))
    }

    /// On-device gather of the cos/sin rows addressed by an `I32` `[1, B]`
    /// index tensor, shaped `[1, B, 1, head_dim]`. Safe to issue inside a
    /// trace capture once it has run eagerly.
    ///
    /// # Errors
    /// Returns an error if any kernel cannot be enqueued.
    pub fn rot_mats_from_idxs(&self, rot_idxs: &B::Tensor) -> Result<(B::Tensor, B::Tensor)> {
        let batch = rot_idxs.shape().last().copied().unwrap_or(0);
        let ids = B::typecast(rot_idxs, DType::U32)?;
        let cos = B::embedding(&ids, &self.cos_table, Layout::Tile)?;
        let sin = B::embedding(&ids, &self.sin_table, Layout::Tile)?;
        let shape = [1, batch, 1, self.head_dim];
        Ok((B::reshape(&cos, &shape)?, B::reshape(&sin, &shape)?))
    }

    /// cos/sin for positions `0..seq_len`, shaped `[1, 1, seq_len, head_dim]`.
    ///
    /// # Errors
    /// Returns a configuration error if `seq_len` exceeds the table.
    pub fn get_prefill_rot_mats(&self, seq_len: usize) -> Result<(B::Tensor, B::Tensor)> {
        if seq_len == 0 || seq_len > self.table_len {
            return Err(Error::config(format!(
                "prefill length {seq_len} outside the RoPE table of {} rows",
                self.table_len
            )));
        }
        let shape = [1, 1, seq_len, self.head_dim];
        let cos = B::slice(&self.cos_table, 0, 0, seq_len)?;
        let sin = B::slice(&self.sin_table, 0, 0, seq_len)?;
        Ok((B::reshape(&cos, &shape)?, B::reshape(&sin, &shape)?))
    }

    /// Rotation basis for decode.
    #[must_use]
    pub fn get_trans_mats(&self) -> &B::Tensor {
        &self.trans_mat
    }

    /// Rotation basis for prefill. Same matrix; prefill broadcasts it over
    /// the sequence.
    #[must_use]
    pub fn get_prefill_trans_mats(&self) -> &B::Tensor {
        &self.trans_mat
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::{MeshControl, QueueId, TensorIo};
    use meshinfer_sim::{MeshConfig, SimBackend, SimMesh};

    use super::*;

    fn args() -> ModelArgs {
        let mut args = ModelArgs::llama_3_2_1b(4, 200);
        args.head_dim = 16;
        args
    }

    fn floats(t: &<SimBackend as meshinfer::Backend>::Tensor) -> Vec<f32> {
        SimBackend::to_host(t).unwrap().into_f32().unwrap()
    }

    #[test]
    fn test_table_len_covers_padded_prefill() {
        assert_eq!(table_len(1), 128);
        assert_eq!(table_len(200), 256);
        assert_eq!(table_len(1024), 1024);
    }

    #[test]
    fn test_device_gather_matches_host_gather() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let rope = RopeIndex::<SimBackend>::new(&mesh, &args()).unwrap();
        let pos = [0, 7, 199, 31];
        let (cos_h, sin_h) = rope.get_rot_mats(&pos).unwrap();
        assert_eq!(cos_h.shape(), &[1, 4, 1, 16]);

        let RotIdxs::Device(idx) = rope.get_rot_idxs(&pos, false).unwrap() else {
            panic!("expected device indices");
        };
        let (cos_d, sin_d) = rope.rot_mats_from_idxs(&idx).unwrap();
        assert_eq!(cos_d.shape(), &[1, 4, 1, 16]);
        assert_eq!(floats(&cos_d), floats(&cos_h));
        assert_eq!(floats(&sin_d), floats(&sin_h));
    }

    #[test]
    fn test_staged_indices_feed_a_bound_tensor() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let rope = RopeIndex::<SimBackend>::new(&mesh, &args()).unwrap();
        let RotIdxs::Device(bound) = rope.get_rot_idxs(&[0, 0], false).unwrap() else {
            panic!("expected device indices");
        };
        let staged = rope.get_rot_idxs(&[5, 9], true).unwrap();
        SimBackend::copy_host_to_device(QueueId::TRANSFER, staged.into_host().unwrap(), &bound).unwrap();
        mesh.synchronize().unwrap();
        let (cos, _) = rope.rot_mats_from_idxs(&bound).unwrap();
        let (expected, _) = rope.get_rot_mats(&[5, 9]).unwrap();
        assert_eq!(floats(&cos), floats(&expected));
    }

    #[test]
    fn test_prefill_rows_start_at_zero() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let rope = RopeIndex::<SimBackend>::new(&mesh, &args()).unwrap();
        let (cos, sin) = rope.get_prefill_rot_mats(128).unwrap();
        assert_eq!(cos.shape(), &[1, 1, 128, 16]);
        let cos = floats(&cos);
        let sin = floats(&sin);
        assert!(cos[..16].iter().all(|c| (c - 1.0).abs() < 1e-6));
        assert!(sin[..16].iter().all(|s| s.abs() < 1e-6));
        assert!(rope.get_prefill_rot_mats(512).is_err());
    }

    #[test]
    fn test_out_of_table_position_is_rejected() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let rope = RopeIndex::<SimBackend>::new(&mesh, &args()).unwrap();
        let err = rope.get_rot_mats(&[256]).err().unwrap();
        assert!(err.to_string().contains("256"));
        assert!(rope.get_rot_idxs(&[-1], false).is_err());
        assert!(rope.get_rot_idxs(&[-1], true).is_ok());
    }
}
