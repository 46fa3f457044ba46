//! Tensor handle trait and the placement attributes every device tensor carries.
//!
//! A device tensor is an opaque handle owned by a backend. Its element type,
//! layout, memory placement and mesh mapping are tracked explicitly in a
//! [`TensorSpec`] and checked at every op boundary rather than inferred.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::mesh::MeshShape;
use crate::{Error, Result};

/// Tile height in elements.
pub const TILE_HEIGHT: usize = 32;
/// Tile width in elements.
pub const TILE_WIDTH: usize = 32;

/// In-memory arrangement of the last two dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// 32x32 tiles; the last two dims are padded up to tile multiples.
    Tile,
    /// Plain row-major.
    RowMajor,
}

/// How an L1 sharded tensor is split across cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardStrategy {
    /// Rows are split across cores; each core holds full rows.
    Height,
    /// Columns are split across cores; each core holds full columns.
    Width,
}

/// A rectangular grid of worker cores, `x` columns by `y` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreGrid {
    pub x: usize,
    pub y: usize,
}

impl CoreGrid {
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub const fn num_cores(&self) -> usize {
        self.x * self.y
    }
}

/// Shard specification for L1-sharded tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    pub grid: CoreGrid,
    /// `[height, width]` of the piece held by each core.
    pub shard_shape: [usize; 2],
    pub strategy: ShardStrategy,
}

/// Where a tensor lives on each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryConfig {
    /// Interleaved across DRAM banks.
    Dram,
    /// Interleaved across L1 of all worker cores.
    L1,
    /// Sharded across the L1 of a core grid.
    L1Sharded(ShardSpec),
}

impl MemoryConfig {
    /// True for any L1 placement.
    #[must_use]
    pub fn is_l1(&self) -> bool {
        !matches!(self, Self::Dram)
    }
}

impl fmt::Display for MemoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dram => write!(f, "dram"),
            Self::L1 => write!(f, "l1"),
            Self::L1Sharded(spec) => write!(
                f,
                "l1-sharded({:?} {}x{} cores, shard {:?})",
                spec.strategy, spec.grid.x, spec.grid.y, spec.shard_shape
            ),
        }
    }
}

/// How a logical tensor maps onto the devices of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshMapping {
    /// Every device holds the full tensor.
    Replicate,
    /// Split evenly along `dim` across all devices in row-major device order.
    Shard { dim: usize },
    /// Split along `dims.0` across mesh rows and `dims.1` across mesh columns.
    /// `None` replicates along that mesh axis.
    Shard2d {
        mesh_shape: MeshShape,
        dims: (Option<usize>, Option<usize>),
    },
}

impl MeshMapping {
    /// Per-dimension element ranges held by `device` (row-major device index).
    ///
    /// # Errors
    /// Returns an error if a sharded dim is out of range or does not divide
    /// evenly, or if a 2-D mapping was built for a different mesh shape.
    pub fn device_ranges(
        &self,
        shape: &[usize],
        mesh: MeshShape,
        device: usize,
    ) -> Result<Vec<Range<usize>>> {
        let mut ranges: Vec<Range<usize>> = shape.iter().map(|&d| 0..d).collect();
        match *self {
            Self::Replicate => {}
            Self::Shard { dim } => {
                split_dim(&mut ranges, shape, dim, mesh.num_devices(), device)?;
            }
            Self::Shard2d { mesh_shape, dims } => {
                if mesh_shape != mesh {
                    return Err(Error::config(format!(
                        "2-D shard mapping built for mesh {mesh_shape} but tensor placed on {mesh}"
                    )));
                }
                let (row, col) = mesh.coords(device);
                if let Some(dim) = dims.0 {
                    split_dim(&mut ranges, shape, dim, mesh.rows, row)?;
                }
                if let Some(dim) = dims.1 {
                    split_dim(&mut ranges, shape, dim, mesh.cols, col)?;
                }
            }
        }
        Ok(ranges)
    }

    /// Shape of the piece held by a single device.
    ///
    /// # Errors
    /// Same conditions as [`Self::device_ranges`].
    pub fn local_shape(&self, shape: &[usize], mesh: MeshShape) -> Result<Vec<usize>> {
        Ok(self
            .device_ranges(shape, mesh, 0)?
            .into_iter()
            .map(|r| r.len())
            .collect())
    }
}

fn split_dim(
    ranges: &mut [Range<usize>],
    shape: &[usize],
    dim: usize,
    parts: usize,
    index: usize,
) -> Result<()> {
    let Some(&extent) = shape.get(dim) else {
        return Err(Error::InvalidShape(format!(
            "shard dim {dim} out of range for shape {shape:?}"
        )));
    };
    if extent % parts != 0 {
        return Err(Error::InvalidShape(format!(
            "dim {dim} of shape {shape:?} does not split into {parts} shards"
        )));
    }
    let chunk = extent / parts;
    ranges[dim] = index * chunk..(index + 1) * chunk;
    Ok(())
}

/// Every attribute of a device tensor besides its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub layout: Layout,
    pub memory: MemoryConfig,
    pub mapping: MeshMapping,
}

impl TensorSpec {
    /// Tile layout, DRAM, replicated.
    #[must_use]
    pub const fn new(dtype: DType) -> Self {
        Self {
            dtype,
            layout: Layout::Tile,
            memory: MemoryConfig::Dram,
            mapping: MeshMapping::Replicate,
        }
    }

    #[must_use]
    pub const fn row_major(mut self) -> Self {
        self.layout = Layout::RowMajor;
        self
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub const fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub const fn with_mapping(mut self, mapping: MeshMapping) -> Self {
        self.mapping = mapping;
        self
    }

    #[must_use]
    pub const fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Check this spec can describe a tensor of `shape` on `mesh`.
    ///
    /// # Errors
    /// Returns an error naming the offending attribute.
    pub fn validate(&self, shape: &[usize], mesh: MeshShape) -> Result<()> {
        if shape.is_empty() {
            return Err(Error::InvalidShape("tensor must have rank >= 1".into()));
        }
        if matches!(self.dtype, DType::BFP8 | DType::BFP4) && self.layout != Layout::Tile {
            return Err(Error::LayoutMismatch {
                expected: "tile layout for block-float dtypes".into(),
                got: format!("{:?} with {}", self.layout, self.dtype),
            });
        }
        let local = self.mapping.local_shape(shape, mesh)?;
        if let MemoryConfig::L1Sharded(spec) = self.memory {
            let padded = padded_shape(&local, self.layout);
            let width = padded[padded.len() - 1];
            let height: usize = padded[..padded.len() - 1].iter().product();
            let [shard_h, shard_w] = spec.shard_shape;
            let fits = match spec.strategy {
                ShardStrategy::Height => {
                    shard_w == width && shard_h * spec.grid.num_cores() >= height
                }
                ShardStrategy::Width => {
                    shard_h >= height && shard_w * spec.grid.num_cores() >= width
                }
            };
            if !fits {
                return Err(Error::InvalidShape(format!(
                    "shard spec {spec:?} cannot hold local shape {local:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Shape padded to tile multiples in the last two dims (no-op for row-major).
#[must_use]
pub fn padded_shape(shape: &[usize], layout: Layout) -> Vec<usize> {
    let mut padded = shape.to_vec();
    if layout == Layout::Tile {
        let n = padded.len();
        padded[n - 1] = padded[n - 1].next_multiple_of(TILE_WIDTH);
        if n >= 2 {
            padded[n - 2] = padded[n - 2].next_multiple_of(TILE_HEIGHT);
        }
    }
    padded
}

/// Device tensor handle implemented by each backend.
pub trait Tensor: Sized {
    /// Logical (global, unpadded) shape across the whole mesh.
    fn shape(&self) -> &[usize];

    /// Placement attributes.
    fn spec(&self) -> &TensorSpec;

    fn dtype(&self) -> DType {
        self.spec().dtype
    }

    fn layout(&self) -> Layout {
        self.spec().layout
    }

    fn memory_config(&self) -> MemoryConfig {
        self.spec().memory
    }

    fn mapping(&self) -> MeshMapping {
        self.spec().mapping
    }

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct FakeTensor {
        shape: Vec<usize>,
        spec: TensorSpec,
    }

    impl Tensor for FakeTensor {
        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn spec(&self) -> &TensorSpec {
            &self.spec
        }
    }

    #[test]
    fn test_default_accessors() {
        let t = FakeTensor {
            shape: vec![1, 1, 32, 64],
            spec: TensorSpec::new(DType::BF16),
        };
        assert_eq!(t.numel(), 2048);
        assert_eq!(t.ndim(), 4);
        assert_eq!(t.layout(), Layout::Tile);
        assert_eq!(t.memory_config(), MemoryConfig::Dram);
        assert_eq!(t.mapping(), MeshMapping::Replicate);
    }

    #[test]
    fn test_padded_shape() {
        assert_eq!(padded_shape(&[1, 1, 8, 40], Layout::Tile), vec![1, 1, 32, 64]);
        assert_eq!(padded_shape(&[8], Layout::Tile), vec![32]);
        assert_eq!(padded_shape(&[1, 8], Layout::RowMajor), vec![1, 8]);
    }

    #[test]
    fn test_shard_ranges_1d() {
        let mesh = MeshShape::new(1, 4);
        let mapping = MeshMapping::Shard { dim: 3 };
        let r = mapping.device_ranges(&[1, 1, 32, 256], mesh, 2).unwrap();
        assert_eq!(r[3], 128..192);
        assert_eq!(r[2], 0..32);
        assert_eq!(
            mapping.local_shape(&[1, 1, 32, 256], mesh).unwrap(),
            vec![1, 1, 32, 64]
        );
    }

    #[test]
    fn test_shard_ranges_2d() {
        let mesh = MeshShape::new(2, 4);
        let mapping = MeshMapping::Shard2d {
            mesh_shape: mesh,
            dims: (Some(2), Some(3)),
        };
        // device 6 is (row 1, col 2)
        let r = mapping.device_ranges(&[1, 1, 64, 128], mesh, 6).unwrap();
        assert_eq!(r[2], 32..64);
        assert_eq!(r[3], 64..96);

        let replicated_rows = MeshMapping::Shard2d {
            mesh_shape: mesh,
            dims: (None, Some(3)),
        };
        let r = replicated_rows.device_ranges(&[1, 1, 64, 128], mesh, 6).unwrap();
        assert_eq!(r[2], 0..64);
    }

    #[test]
    fn test_uneven_shard_is_rejected() {
        let mesh = MeshShape::new(1, 3);
        let err = MeshMapping::Shard { dim: 0 }
            .local_shape(&[8], mesh)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
    }

    #[test]
    fn test_2d_mapping_requires_matching_mesh() {
        let mapping = MeshMapping::Shard2d {
            mesh_shape: MeshShape::new(2, 2),
            dims: (Some(0), None),
        };
        assert!(mapping.local_shape(&[4, 4], MeshShape::new(1, 4)).is_err());
    }

    #[test]
    fn test_validate_block_float_needs_tile() {
        let spec = TensorSpec::new(DType::BFP8).row_major();
        let err = spec.validate(&[32, 32], MeshShape::new(1, 1)).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { .. }));
    }

    #[test]
    fn test_validate_height_sharded() {
        let mesh = MeshShape::new(1, 1);
        let ok = TensorSpec::new(DType::BF16).with_memory(MemoryConfig::L1Sharded(ShardSpec {
            grid: CoreGrid::new(4, 1),
            shard_shape: [32, 64],
            strategy: ShardStrategy::Height,
        }));
        assert!(ok.validate(&[1, 1, 128, 64], mesh).is_ok());
        assert!(ok.validate(&[1, 1, 256, 64], mesh).is_err());
    }
}
