//! Paged KV-cache manager.
//!
//! Owns one K and one V slab per layer, sharded along the kv-head dim, and
//! the page table that maps each user's logical blocks onto the pool. Block
//! contents are only ever written by the attention kernels; the manager
//! itself only zeroes them between repeat-batches.

use meshinfer::model::LayerKvCache;
use meshinfer::{
    Backend, DType, Error, HostData, KernelRuntime, MeshControl, MeshMapping, ModelArgs, PageParams,
    PageTable, Result, TensorSpec,
};

/// Host page table together with its device copy.
pub struct PagedTable<T> {
    pub host: PageTable,
    pub device: T,
}

/// Build the page table for `batch` users and upload it, replicated, as an
/// `I32` `[batch, blocks_per_user]` tensor.
///
/// # Errors
/// Returns a configuration error for unusable page params or the
/// allocation error of the upload.
pub fn make_page_table<B: KernelRuntime>(
    mesh: &B::Mesh,
    batch: usize,
    params: &PageParams,
    seed: u64,
) -> Result<PagedTable<B::Tensor>> {
    let host = PageTable::new(batch, params, seed)?;
    let device = B::from_host(
        mesh,
        &host.shape(),
        HostData::I32(host.to_i32()),
        TensorSpec::new(DType::I32).row_major(),
    )?;
    Ok(PagedTable { host, device })
}

/// KV slabs for every layer plus the optional page table.
pub struct KvCacheManager<B: Backend> {
    layers: Vec<LayerKvCache<B::Tensor>>,
    pages: Option<PagedTable<B::Tensor>>,
    slab_shape: [usize; 4],
    slab_bytes: usize,
}

impl<B: KernelRuntime> KvCacheManager<B> {
    /// Allocate a zeroed cache for `batch` users of up to `max_seq_len`
    /// tokens each, paged when `paging` is given.
    ///
    /// # Errors
    /// Returns a configuration error if the pool cannot hold
    /// `batch * max_seq_len` tokens, or `OutOfMemory` with the size of the
    /// slab that did not fit.
    pub fn new(
        mesh: &B::Mesh,
        args: &ModelArgs,
        batch: usize,
        max_seq_len: usize,
        paging: Option<(&PageParams, u64)>,
    ) -> Result<Self> {
        let pages = match paging {
            Some((params, seed)) => {
                let capacity = params.page_block_size * params.page_max_num_blocks;
                if capacity < batch * max_seq_len {
                    return Err(Error::config(format!(
                        "page pool holds {capacity} tokens, {batch} users of {max_seq_len} need {}",
                        batch * max_seq_len
                    )));
                }
                Some(make_page_table::<B>(mesh, batch, params, seed)?)
            }
            None => None,
        };
        let slab_shape = match &pages {
            Some(p) => [
                p.host.max_num_blocks(),
                args.n_kv_heads,
                p.host.block_size(),
                args.head_dim,
            ],
            None => [batch, args.n_kv_heads, max_seq_len, args.head_dim],
        };
        let spec = TensorSpec::new(args.kv_cache_dtype).with_mapping(MeshMapping::Shard { dim: 1 });
        let devices = mesh.shape().num_devices();
        let slab_bytes = args
            .kv_cache_dtype
            .bytes_for(slab_shape.iter().product::<usize>() / devices);
        log::info!(
            "Allocating {} KV cache: {} layers x 2 slabs of {slab_shape:?} {} ({} MiB per device)",
            if pages.is_some() { "paged" } else { "contiguous" },
            args.num_layers,
            args.kv_cache_dtype,
            (2 * args.num_layers * slab_bytes) >> 20
        );

        let mut layers = Vec::with_capacity(args.num_layers);
        for layer in 0..args.num_layers {
            let slab = || {
                B::zeros(mesh, &slab_shape, spec).map_err(|e| match e {
                    Error::OutOfMemory {
                        requested,
                        available,
                        ..
                    } => Error::OutOfMemory {
                        what: format!("KV cache slab {slab_shape:?} of layer {layer}"),
                        requested,
                        available,
                    },
                    other => other,
                })
            };
            layers.push(LayerKvCache {
                k: slab()?,
                v: slab()?,
            });
        }
        Ok(Self {
            layers,
            pages,
            slab_shape,
            slab_bytes,
        })
    }

    /// Per-layer K/V handles in layer order.
    #[must_use]
    pub fn per_layer_handles(&self) -> &[LayerKvCache<B::Tensor>] {
        &self.layers
    }

    /// Device page table, `None` for a contiguous cache.
    #[must_use]
    pub fn page_table(&self) -> Option<&B::Tensor> {
        self.pages.as_ref().map(|p| &p.device)
    }

    #[must_use]
    pub fn host_page_table(&self) -> Option<&PageTable> {
        self.pages.as_ref().map(|p| &p.host)
    }

    #[must_use]
    pub fn slab_shape(&self) -> [usize; 4] {
        self.slab_shape
    }

    /// Bytes of one slab on one device.
    #[must_use]
    pub fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }

    /// Zero every block of every slab on every device.
    ///
    /// # Errors
    /// Returns an error if a fill cannot be enqueued.
    pub fn zero_all(&self) -> Result<()> {
        for layer in &self.layers {
            B::fill_zero(&layer.k)?;
            B::fill_zero(&layer.v)?;
        }
        log::debug!("Zeroed {} KV slabs", 2 * self.layers.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::{ErrorKind, Optimizations, Tensor, TensorIo};
    use meshinfer_sim::{MeshConfig, SimBackend, SimMesh};

    use super::*;

    fn args() -> ModelArgs {
        ModelArgs {
            model_name: "tiny".into(),
            num_layers: 2,
            dim: 64,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 16,
            hidden_dim: 128,
            vocab_size: 264,
            max_seq_len: 256,
            max_batch_size: 4,
            norm_eps: 1e-5,
            rope_theta: 10_000.0,
            use_scaled_rope: false,
            rope_scaling: None,
            optimizations: Optimizations::Accuracy,
            kv_cache_dtype: DType::BF16,
            weights_dtype: DType::BF16,
        }
    }

    fn paging() -> PageParams {
        PageParams {
            page_block_size: 32,
            page_max_num_blocks: 32,
        }
    }

    #[test]
    fn test_paged_slabs_follow_pool_geometry() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let kv = KvCacheManager::<SimBackend>::new(&mesh, &args(), 4, 256, Some((&paging(), 3))).unwrap();
        assert_eq!(kv.per_layer_handles().len(), 2);
        assert_eq!(kv.slab_shape(), [32, 2, 32, 16]);
        let k = &kv.per_layer_handles()[0].k;
        assert_eq!(k.mapping(), MeshMapping::Shard { dim: 1 });

        let table = SimBackend::to_host(kv.page_table().unwrap()).unwrap().into_i32().unwrap();
        assert_eq!(table.len(), 32);
        let mut seen = table.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 32);
        assert!(table.iter().all(|&b| (0..32).contains(&b)));
    }

    #[test]
    fn test_contiguous_has_no_page_table() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let kv = KvCacheManager::<SimBackend>::new(&mesh, &args(), 2, 128, None).unwrap();
        assert!(kv.page_table().is_none());
        assert_eq!(kv.slab_shape(), [2, 2, 128, 16]);
    }

    #[test]
    fn test_small_pool_is_config_error() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let err = KvCacheManager::<SimBackend>::new(&mesh, &args(), 4, 512, Some((&paging(), 0)))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_oom_names_the_slab() {
        let mesh = SimMesh::open(MeshConfig {
            dram_size: 16 << 20,
            trace_region_size: 1 << 20,
            ..MeshConfig::default()
        })
        .unwrap();
        let mut big = args();
        big.max_seq_len = 1 << 14;
        let err = KvCacheManager::<SimBackend>::new(&mesh, &big, 4, 1 << 14, None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.to_string().contains("KV cache slab"));
    }

    #[test]
    fn test_zero_all_clears_every_slab() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let kv = KvCacheManager::<SimBackend>::new(&mesh, &args(), 2, 64, None).unwrap();
        let shape = kv.slab_shape();
        let ones = vec![1.0_f32; shape.iter().product()];
        for layer in kv.per_layer_handles() {
            SimBackend::copy_host_to_device(meshinfer::QueueId::COMPUTE, HostData::F32(ones.clone()), &layer.k)
                .unwrap();
        }
        kv.zero_all().unwrap();
        mesh.synchronize().unwrap();
        for layer in kv.per_layer_handles() {
            for slab in [&layer.k, &layer.v] {
                let data = SimBackend::to_host(slab).unwrap().into_f32().unwrap();
                assert!(data.iter().all(|&x| x == 0.0));
            }
        }
    }
}
