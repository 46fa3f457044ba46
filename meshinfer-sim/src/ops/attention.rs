//! AttentionOps implementation for SimBackend.
//!
//! KV caches are sharded along the kv-head dim (or replicated). A contiguous
//! cache is `[max_batch, n_kv, max_seq, head_dim]`; a paged cache is
//! `[max_num_blocks, n_kv, block_size, head_dim]` and is addressed through
//! an `I32` page table `[max_batch, blocks_per_user]` mapping each user's
//! logical blocks to physical ones.

use meshinfer::backend::AttentionOps;
use meshinfer::dtype::DType;
use meshinfer::tensor::{MeshMapping, Tensor};
use meshinfer::{Error, Result};

use crate::memory::{DeviceData, DeviceMemory};
use crate::ops::{launch, program_key, require_dtype, require_float, require_rank, same_mesh};
use crate::quant::quantize;
use crate::tensor::SimTensor;
use crate::SimBackend;

/// Local geometry of a cache slab on one device.
#[derive(Debug, Clone, Copy)]
struct CacheGeom {
    slots: usize,
    kv_heads: usize,
    rows: usize,
    head_dim: usize,
}

impl CacheGeom {
    fn of(cache: &SimTensor) -> Result<Self> {
        require_rank(cache, 4, "kv cache")?;
        let l = cache.local_shape();
        Ok(Self {
            slots: l[0],
            kv_heads: l[1],
            rows: l[2],
            head_dim: l[3],
        })
    }

    fn offset(&self, slot: usize, head: usize, row: usize) -> usize {
        ((slot * self.kv_heads + head) * self.rows + row) * self.head_dim
    }
}

/// Page table contents and width, when the cache is paged.
struct Pages {
    table: Vec<i32>,
    blocks_per_user: usize,
}

#[derive(Clone, Copy)]
struct PageTableRef {
    id: u64,
    users: usize,
    blocks_per_user: usize,
}

impl PageTableRef {
    fn of(page_table: Option<&SimTensor>) -> Result<Option<Self>> {
        let Some(pt) = page_table else {
            return Ok(None);
        };
        require_dtype(pt, DType::I32, "page table")?;
        require_rank(pt, 2, "page table")?;
        if pt.mapping() != MeshMapping::Replicate {
            return Err(Error::config("page table must be replicated"));
        }
        Ok(Some(Self {
            id: pt.id(),
            users: pt.shape()[0],
            blocks_per_user: pt.shape()[1],
        }))
    }

    fn load(this: Option<Self>, mem: &DeviceMemory, device: usize) -> Result<Option<Pages>> {
        this.map(|pt| {
            Ok(Pages {
                table: mem.i32(pt.id, device)?.to_vec(),
                blocks_per_user: pt.blocks_per_user,
            })
        })
        .transpose()
    }
}

/// Cache slot and row holding `pos` of `user`, or `None` past its capacity.
fn locate(geom: &CacheGeom, pages: Option<&Pages>, user: usize, pos: usize) -> Result<Option<(usize, usize)>> {
    match pages {
        Some(pages) => {
            let logical = pos / geom.rows;
            if logical >= pages.blocks_per_user {
                return Ok(None);
            }
            let physical = pages.table[user * pages.blocks_per_user + logical];
            let slot = usize::try_from(physical)
                .ok()
                .filter(|&s| s < geom.slots)
                .ok_or_else(|| {
                    Error::Device(format!(
                        "page table maps user {user} block {logical} to invalid block {physical}"
                    ))
                })?;
            Ok(Some((slot, pos % geom.rows)))
        }
        None => {
            if user >= geom.slots {
                return Err(Error::Device(format!(
                    "user {user} outside a {}-user cache",
                    geom.slots
                )));
            }
            Ok((pos < geom.rows).then_some((user, pos)))
        }
    }
}

/// Whether `t` is sharded along `dim` (true) or replicated (false).
fn head_sharded(t: &SimTensor, dim: usize) -> Result<bool> {
    match t.mapping() {
        MeshMapping::Replicate => Ok(false),
        MeshMapping::Shard { dim: d } if d == dim => Ok(true),
        other => Err(Error::config(format!(
            "attention tensor {:?} must be replicated or sharded along dim {dim}, got {other:?}",
            t.shape()
        ))),
    }
}

fn softmax_weighted_sum(scores: &mut [f32], values: &[&[f32]], out: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        total += *s;
    }
    out.fill(0.0);
    for (p, v) in scores.iter().zip(values) {
        let w = p / total;
        for (o, x) in out.iter_mut().zip(v.iter()) {
            *o += w * x;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn positions(mem: &DeviceMemory, id: u64, device: usize) -> Result<Vec<i32>> {
    Ok(mem.i32(id, device)?.to_vec())
}

impl AttentionOps for SimBackend {
    fn fill_cache(
        cache: &SimTensor,
        input: &SimTensor,
        user: usize,
        page_table: Option<&SimTensor>,
    ) -> Result<()> {
        same_mesh(cache, input)?;
        require_float(cache, "fill_cache")?;
        require_float(input, "fill_cache")?;
        require_rank(input, 4, "fill_cache")?;
        let geom = CacheGeom::of(cache)?;
        if head_sharded(cache, 1)? != head_sharded(input, 1)? {
            return Err(Error::config("fill_cache input and cache are split differently"));
        }
        let local = input.local_shape().to_vec();
        if local[1] != geom.kv_heads || local[3] != geom.head_dim {
            return Err(Error::ShapeMismatch {
                expected: vec![1, geom.kv_heads, local[2], geom.head_dim],
                got: local,
            });
        }
        let pt = PageTableRef::of(page_table)?;
        let users = pt.map_or(geom.slots, |p| p.users);
        if user >= users {
            return Err(Error::config(format!(
                "fill_cache user {user} outside a {users}-user cache"
            )));
        }
        let seq_len = local[2];
        let dtype = cache.dtype();
        let (cache_id, src) = (cache.id(), input.id());
        let mesh = cache.mesh();
        let devices = mesh.num_devices();
        let mut tensors = vec![cache, input];
        tensors.extend(page_table);
        let key = program_key("fill_cache", &tensors, "");
        launch(mesh, "fill_cache", key, &tensors, move |mem| {
            for device in 0..devices {
                let pages = PageTableRef::load(pt, mem, device)?;
                let x = mem.f32(src, device)?.to_vec();
                let slab = mem.f32_mut(cache_id, device)?;
                let hd = geom.head_dim;
                for head in 0..geom.kv_heads {
                    for pos in 0..seq_len {
                        let Some((slot, row)) = locate(&geom, pages.as_ref(), user, pos)? else {
                            continue;
                        };
                        let from = (head * seq_len + pos) * hd;
                        let to = geom.offset(slot, head, row);
                        let dst = &mut slab[to..to + hd];
                        dst.copy_from_slice(&x[from..from + hd]);
                        quantize(dtype, dst);
                    }
                }
            }
            Ok(())
        })
    }

    fn update_cache(
        cache: &SimTensor,
        input: &SimTensor,
        cur_pos: &SimTensor,
        page_table: Option<&SimTensor>,
    ) -> Result<()> {
        same_mesh(cache, input)?;
        require_float(cache, "update_cache")?;
        require_float(input, "update_cache")?;
        require_rank(input, 4, "update_cache")?;
        require_dtype(cur_pos, DType::I32, "update_cache positions")?;
        let geom = CacheGeom::of(cache)?;
        if head_sharded(cache, 1)? != head_sharded(input, 2)? {
            return Err(Error::config("update_cache input and cache are split differently"));
        }
        let local = input.local_shape().to_vec();
        let batch = local[1];
        if local[2] != geom.kv_heads || local[3] != geom.head_dim || cur_pos.numel() != batch {
            return Err(Error::ShapeMismatch {
                expected: vec![1, cur_pos.numel(), geom.kv_heads, geom.head_dim],
                got: local,
            });
        }
        let pt = PageTableRef::of(page_table)?;
        let users = pt.map_or(geom.slots, |p| p.users);
        if batch > users {
            return Err(Error::config(format!(
                "update_cache batch {batch} larger than the {users}-user cache"
            )));
        }
        let dtype = cache.dtype();
        let (cache_id, src, pos_id) = (cache.id(), input.id(), cur_pos.id());
        let mesh = cache.mesh();
        let devices = mesh.num_devices();
        let mut tensors = vec![cache, input, cur_pos];
        tensors.extend(page_table);
        let key = program_key("update_cache", &tensors, "");
        launch(mesh, "update_cache", key, &tensors, move |mem| {
            for device in 0..devices {
                let pages = PageTableRef::load(pt, mem, device)?;
                let pos = positions(mem, pos_id, device)?;
                let x = mem.f32(src, device)?.to_vec();
                let slab = mem.f32_mut(cache_id, device)?;
                let hd = geom.head_dim;
                for (user, &p) in pos.iter().enumerate() {
                    let Ok(p) = usize::try_from(p) else {
                        continue;
                    };
                    let (slot, row) = locate(&geom, pages.as_ref(), user, p)?.ok_or_else(|| {
                        Error::Device(format!(
                            "position {p} of user {user} is beyond the KV cache capacity"
                        ))
                    })?;
                    for head in 0..geom.kv_heads {
                        let from = (user * geom.kv_heads + head) * hd;
                        let to = geom.offset(slot, head, row);
                        let dst = &mut slab[to..to + hd];
                        dst.copy_from_slice(&x[from..from + hd]);
                        quantize(dtype, dst);
                    }
                }
            }
            Ok(())
        })
    }

    fn sdpa_prefill(q: &SimTensor, k: &SimTensor, v: &SimTensor, scale: f32) -> Result<SimTensor> {
        for t in [k, v] {
            same_mesh(q, t)?;
            require_float(t, "sdpa_prefill")?;
            require_rank(t, 4, "sdpa_prefill")?;
        }
        require_float(q, "sdpa_prefill")?;
        require_rank(q, 4, "sdpa_prefill")?;
        let sharded = head_sharded(q, 1)?;
        if head_sharded(k, 1)? != sharded || head_sharded(v, 1)? != sharded || k.shape() != v.shape() {
            return Err(Error::config("sdpa_prefill q, k and v are split differently"));
        }
        let (lq, lk) = (q.local_shape().to_vec(), k.local_shape().to_vec());
        let (heads, seq, hd) = (lq[1], lq[2], lq[3]);
        let kv_heads = lk[1];
        if kv_heads == 0 || heads % kv_heads != 0 || lk[2] != seq || lk[3] != hd {
            return Err(Error::ShapeMismatch {
                expected: vec![1, kv_heads, seq, hd],
                got: lk,
            });
        }
        let group = heads / kv_heads;
        let mesh = q.mesh();
        let output = mesh.allocate(q.shape(), *q.spec(), "sdpa_prefill")?;
        let (q_id, k_id, v_id, dst) = (q.id(), k.id(), v.id(), output.id());
        let dtype = q.dtype();
        let devices = mesh.num_devices();
        let key = program_key("sdpa_prefill", &[q, k, v], &format!("{scale}"));
        launch(mesh, "sdpa_prefill", key, &[q, k, v, &output], move |mem| {
            for device in 0..devices {
                let qs = mem.f32(q_id, device)?;
                let ks = mem.f32(k_id, device)?;
                let vs = mem.f32(v_id, device)?;
                let mut out = vec![0.0_f32; qs.len()];
                for h in 0..heads {
                    let kvh = h / group;
                    for i in 0..seq {
                        let qrow = &qs[(h * seq + i) * hd..][..hd];
                        let mut scores: Vec<f32> = (0..=i)
                            .map(|j| dot(qrow, &ks[(kvh * seq + j) * hd..][..hd]) * scale)
                            .collect();
                        let values: Vec<&[f32]> =
                            (0..=i).map(|j| &vs[(kvh * seq + j) * hd..][..hd]).collect();
                        softmax_weighted_sum(&mut scores, &values, &mut out[(h * seq + i) * hd..][..hd]);
                    }
                }
                quantize(dtype, &mut out);
                mem.store(dst, device, DeviceData::F32(out))?;
            }
            Ok(())
        })?;
        Ok(output)
    }

    fn sdpa_decode(
        q: &SimTensor,
        k_cache: &SimTensor,
        v_cache: &SimTensor,
        cur_pos: &SimTensor,
        page_table: Option<&SimTensor>,
        scale: f32,
    ) -> Result<SimTensor> {
        for t in [k_cache, v_cache, cur_pos] {
            same_mesh(q, t)?;
        }
        require_float(q, "sdpa_decode")?;
        require_rank(q, 4, "sdpa_decode")?;
        require_dtype(cur_pos, DType::I32, "sdpa_decode positions")?;
        let geom = CacheGeom::of(k_cache)?;
        if k_cache.shape() != v_cache.shape() || head_sharded(k_cache, 1)? != head_sharded(q, 2)? {
            return Err(Error::config("sdpa_decode q and caches are split differently"));
        }
        let lq = q.local_shape().to_vec();
        let (batch, heads, hd) = (lq[1], lq[2], lq[3]);
        if hd != geom.head_dim || geom.kv_heads == 0 || heads % geom.kv_heads != 0 || cur_pos.numel() != batch {
            return Err(Error::ShapeMismatch {
                expected: vec![1, cur_pos.numel(), geom.kv_heads, geom.head_dim],
                got: lq,
            });
        }
        let group = heads / geom.kv_heads;
        let pt = PageTableRef::of(page_table)?;
        let mesh = q.mesh();
        let output = mesh.allocate(q.shape(), *q.spec(), "sdpa_decode")?;
        let (q_id, k_id, v_id, pos_id, dst) =
            (q.id(), k_cache.id(), v_cache.id(), cur_pos.id(), output.id());
        let dtype = q.dtype();
        let devices = mesh.num_devices();
        let mut tensors = vec![q, k_cache, v_cache, cur_pos];
        tensors.extend(page_table);
        let key = program_key("sdpa_decode", &tensors, &format!("{scale}"));
        tensors.push(&output);
        launch(mesh, "sdpa_decode", key, &tensors, move |mem| {
            for device in 0..devices {
                let pages = PageTableRef::load(pt, mem, device)?;
                let pos = positions(mem, pos_id, device)?;
                let qs = mem.f32(q_id, device)?;
                let ks = mem.f32(k_id, device)?;
                let vs = mem.f32(v_id, device)?;
                let mut out = vec![0.0_f32; qs.len()];
                for (user, &p) in pos.iter().enumerate() {
                    let Ok(p) = usize::try_from(p) else {
                        continue;
                    };
                    let mut rows = Vec::with_capacity(p + 1);
                    for t in 0..=p {
                        let loc = locate(&geom, pages.as_ref(), user, t)?.ok_or_else(|| {
                            Error::Device(format!(
                                "position {t} of user {user} is beyond the KV cache capacity"
                            ))
                        })?;
                        rows.push(loc);
                    }
                    for h in 0..heads {
                        let kvh = h / group;
                        let base = (user * heads + h) * hd;
                        let qrow = &qs[base..base + hd];
                        let mut scores: Vec<f32> = rows
                            .iter()
                            .map(|&(slot, row)| dot(qrow, &ks[geom.offset(slot, kvh, row)..][..hd]) * scale)
                            .collect();
                        let values: Vec<&[f32]> = rows
                            .iter()
                            .map(|&(slot, row)| &vs[geom.offset(slot, kvh, row)..][..hd])
                            .collect();
                        softmax_weighted_sum(&mut scores, &values, &mut out[base..base + hd]);
                    }
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
    use meshinfer::host::HostData;
    use meshinfer::tensor::TensorSpec;

    use super::*;
    use crate::config::MeshConfig;
    use crate::SimMesh;

    fn floats(mesh: &SimMesh, shape: &[usize], data: Vec<f32>, mapping: MeshMapping) -> SimTensor {
        SimBackend::from_host(
            mesh,
            shape,
            HostData::F32(data),
            TensorSpec::new(DType::F32).with_mapping(mapping),
        )
        .unwrap()
    }

    fn ints(mesh: &SimMesh, shape: &[usize], data: Vec<i32>) -> SimTensor {
        SimBackend::from_host(
            mesh,
            shape,
            HostData::I32(data),
            TensorSpec::new(DType::I32).row_major(),
        )
        .unwrap()
    }

    #[test]
    fn test_paged_fill_uses_page_table() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        // 4 blocks of 2 rows, 1 kv head, head_dim 2; 2 users x 2 blocks
        let cache = SimBackend::zeros(&mesh, &[4, 1, 2, 2], TensorSpec::new(DType::F32)).unwrap();
        let pt = ints(&mesh, &[2, 2], vec![3, 1, 0, 2]);
        let kv = floats(&mesh, &[1, 1, 3, 2], vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0], MeshMapping::Replicate);
        SimBackend::fill_cache(&cache, &kv, 0, Some(&pt)).unwrap();
        let data = SimBackend::to_host(&cache).unwrap().into_f32().unwrap();
        // positions 0,1 -> block 3; position 2 -> block 1 row 0
        assert_eq!(&data[12..16], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&data[4..6], &[3.0, 3.0]);
        assert_eq!(&data[0..4], &[0.0; 4]);
    }

    #[test]
    fn test_fill_skips_positions_past_capacity() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let cache = SimBackend::zeros(&mesh, &[1, 1, 2, 2], TensorSpec::new(DType::F32)).unwrap();
        let kv = floats(&mesh, &[1, 1, 4, 2], (1..=8).map(|x| x as f32).collect(), MeshMapping::Replicate);
        SimBackend::fill_cache(&cache, &kv, 0, None).unwrap();
        assert_eq!(
            SimBackend::to_host(&cache).unwrap(),
            HostData::F32(vec![1.0, 2.0, 3.0, 4.0])
        );
    }

    #[test]
    fn test_causal_prefill_first_row_copies_value() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let q = floats(&mesh, &[1, 2, 2, 2], vec![1.0; 8], MeshMapping::Replicate);
        let k = floats(&mesh, &[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0], MeshMapping::Replicate);
        let v = floats(&mesh, &[1, 1, 2, 2], vec![5.0, 6.0, 7.0, 8.0], MeshMapping::Replicate);
        let out = SimBackend::sdpa_prefill(&q, &k, &v, 1.0).unwrap();
        let data = SimBackend::to_host(&out).unwrap().into_f32().unwrap();
        // row 0 of each head only sees position 0
        assert_eq!(&data[0..2], &[5.0, 6.0]);
        assert_eq!(&data[4..6], &[5.0, 6.0]);
        // row 1 sees both with equal scores
        assert!((data[2] - 6.0).abs() < 1e-5);
        assert!((data[3] - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_decode_update_then_attend() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        // 2 users, 2 kv heads split over 2 devices, 4 positions, head_dim 2
        let cache_spec = TensorSpec::new(DType::F32).with_mapping(MeshMapping::Shard { dim: 1 });
        let k = SimBackend::zeros(&mesh, &[2, 2, 4, 2], cache_spec).unwrap();
        let v = SimBackend::zeros(&mesh, &[2, 2, 4, 2], cache_spec).unwrap();
        let pos = ints(&mesh, &[2], vec![0, -1]);
        let new_kv = floats(&mesh, &[1, 2, 2, 2], vec![1.0; 8], MeshMapping::Shard { dim: 2 });
        let new_v = floats(
            &mesh,
            &[1, 2, 2, 2],
            vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
            MeshMapping::Shard { dim: 2 },
        );
        SimBackend::update_cache(&k, &new_kv, &pos, None).unwrap();
        SimBackend::update_cache(&v, &new_v, &pos, None).unwrap();
        let q = floats(&mesh, &[1, 2, 2, 2], vec![1.0; 8], MeshMapping::Shard { dim: 2 });
        let out = SimBackend::sdpa_decode(&q, &k, &v, &pos, None, 1.0).unwrap();
        let data = SimBackend::to_host(&out).unwrap().into_f32().unwrap();
        // user 0 attends to its only position; user 1 is skipped
        assert_eq!(&data[0..4], &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(&data[4..8], &[0.0; 4]);
    }

    #[test]
    fn test_update_past_capacity_fails() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let cache = SimBackend::zeros(&mesh, &[1, 1, 2, 2], TensorSpec::new(DType::F32)).unwrap();
        let pos = ints(&mesh, &[1], vec![2]);
        let x = floats(&mesh, &[1, 1, 1, 2], vec![1.0, 1.0], MeshMapping::Replicate);
        SimBackend::update_cache(&cache, &x, &pos, None).unwrap();
        assert!(SimBackend::to_host(&cache).is_err());
    }
}
