//! Geometry and capacities of a simulated mesh.

use serde::{Deserialize, Serialize};

use meshinfer::mesh::MeshShape;
use meshinfer::tensor::CoreGrid;
use meshinfer::{Error, Result};

/// DRAM per chip.
pub const DEFAULT_DRAM_SIZE: usize = 12 << 30;
/// L1 per worker core.
pub const DEFAULT_L1_SIZE_PER_CORE: usize = 1_499_136;
/// Trace region reserved out of DRAM when the mesh opens.
pub const DEFAULT_TRACE_REGION_SIZE: usize = 23_887_872;

/// Options for [`crate::SimMesh::open`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub device_grid: MeshShape,
    /// DRAM bytes per chip, including the trace region.
    pub dram_size: usize,
    pub l1_size_per_core: usize,
    /// Worker cores per chip.
    pub compute_grid: CoreGrid,
    pub trace_region_size: usize,
    pub num_command_queues: usize,
    /// When false every enqueue drains whatever the queues can run.
    pub async_mode: bool,
    /// Keep a log of executed commands for [`crate::SimMesh::command_log`].
    pub record_log: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device_grid: MeshShape::new(1, 1),
            dram_size: DEFAULT_DRAM_SIZE,
            l1_size_per_core: DEFAULT_L1_SIZE_PER_CORE,
            compute_grid: CoreGrid::new(8, 8),
            trace_region_size: DEFAULT_TRACE_REGION_SIZE,
            num_command_queues: 2,
            async_mode: true,
            record_log: false,
        }
    }
}

impl MeshConfig {
    /// Default capacities on a `rows x cols` grid.
    #[must_use]
    pub fn with_grid(rows: usize, cols: usize) -> Self {
        Self {
            device_grid: MeshShape::new(rows, cols),
            ..Self::default()
        }
    }

    /// L1 bytes per chip.
    #[must_use]
    pub fn l1_size(&self) -> usize {
        self.l1_size_per_core * self.compute_grid.num_cores()
    }

    /// # Errors
    /// Returns a configuration error naming the bad field.
    pub fn validate(&self) -> Result<()> {
        if self.device_grid.num_devices() == 0 {
            return Err(Error::config(format!(
                "device grid {} has no devices",
                self.device_grid
            )));
        }
        if !(1..=2).contains(&self.num_command_queues) {
            return Err(Error::config(format!(
                "num_command_queues must be 1 or 2, got {}",
                self.num_command_queues
            )));
        }
        if self.compute_grid.num_cores() == 0 {
            return Err(Error::config("compute grid has no cores"));
        }
        if self.trace_region_size >= self.dram_size {
            return Err(Error::config(format!(
                "trace region of {} bytes does not fit in {} bytes of DRAM",
                self.trace_region_size, self.dram_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MeshConfig::with_grid(1, 8);
        config.validate().unwrap();
        assert_eq!(config.device_grid.num_devices(), 8);
        assert_eq!(config.l1_size(), 64 * DEFAULT_L1_SIZE_PER_CORE);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"device_grid": {"rows": 2, "cols": 4}, "num_command_queues": 1}"#)
                .unwrap();
        assert_eq!(config.device_grid, MeshShape::new(2, 4));
        assert_eq!(config.num_command_queues, 1);
        assert_eq!(config.trace_region_size, DEFAULT_TRACE_REGION_SIZE);
    }

    #[test]
    fn test_rejects_three_queues() {
        let config = MeshConfig {
            num_command_queues: 3,
            ..MeshConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
