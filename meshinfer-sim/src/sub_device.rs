//! Sub-device partitioning, stall groups, global semaphores and the
//! persistent fabric.

use std::collections::HashMap;

use meshinfer::backend::GlobalSemaphore;
use meshinfer::mesh::{CoreRangeSet, SubDevice, SubDeviceId, SubDeviceManagerId};
use meshinfer::tensor::CoreGrid;
use meshinfer::{Error, Result};

/// A counter shared by every chip of one mesh.
#[derive(Debug, Clone)]
pub struct SimSemaphore {
    pub(crate) mesh_id: u64,
    pub(crate) index: usize,
    pub(crate) addresses: Vec<usize>,
}

impl GlobalSemaphore for SimSemaphore {
    fn addresses(&self) -> Vec<usize> {
        self.addresses.clone()
    }
}

#[derive(Debug)]
struct Manager {
    sub_devices: Vec<SubDevice>,
    local_l1_size: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SubDeviceState {
    managers: HashMap<u32, Manager>,
    next_manager: u32,
    loaded: Option<u32>,
    stall_group: Option<Vec<SubDeviceId>>,
    pub fabric_enabled: bool,
}

/// Every range of `cores` must lie inside `grid`.
pub(crate) fn check_in_grid(cores: &CoreRangeSet, grid: CoreGrid) -> Result<()> {
    if cores.ranges.is_empty() {
        return Err(Error::config("core range set is empty"));
    }
    for range in &cores.ranges {
        if range.start.x > range.end.x || range.start.y > range.end.y {
            return Err(Error::config(format!("inverted core range {range:?}")));
        }
        if range.end.x >= grid.x || range.end.y >= grid.y {
            return Err(Error::config(format!(
                "core range {range:?} outside the {}x{} compute grid",
                grid.x, grid.y
            )));
        }
    }
    Ok(())
}

impl SubDeviceState {
    pub(crate) fn create_manager(
        &mut self,
        sub_devices: &[SubDevice],
        local_l1_size: usize,
        grid: CoreGrid,
    ) -> Result<SubDeviceManagerId> {
        if sub_devices.is_empty() {
            return Err(Error::config("a sub-device manager needs at least one sub-device"));
        }
        for (i, sub) in sub_devices.iter().enumerate() {
            check_in_grid(&sub.cores, grid)?;
            for (j, other) in sub_devices.iter().enumerate().skip(i + 1) {
                if sub.cores.intersects(&other.cores) {
                    return Err(Error::config(format!(
                        "sub-devices {i} and {j} share cores"
                    )));
                }
            }
        }
        let id = self.next_manager;
        self.next_manager += 1;
        self.managers.insert(
            id,
            Manager {
                sub_devices: sub_devices.to_vec(),
                local_l1_size,
            },
        );
        log::debug!(
            "Created sub-device manager {id} with {} sub-devices",
            sub_devices.len()
        );
        Ok(SubDeviceManagerId(id))
    }

    /// Returns the per-core L1 the manager reserves, for accounting.
    pub(crate) fn load(&mut self, manager: SubDeviceManagerId) -> Result<usize> {
        let entry = self
            .managers
            .get(&manager.0)
            .ok_or_else(|| Error::config(format!("unknown sub-device manager {}", manager.0)))?;
        if self.loaded.is_some() {
            return Err(Error::config(
                "a sub-device manager is already loaded; clear it first",
            ));
        }
        self.loaded = Some(manager.0);
        self.stall_group = None;
        log::debug!("Loaded sub-device manager {}", manager.0);
        Ok(entry.local_l1_size)
    }

    /// Returns the per-core L1 the manager had reserved.
    pub(crate) fn clear_loaded(&mut self) -> Result<usize> {
        let id = self
            .loaded
            .take()
            .ok_or_else(|| Error::config("no sub-device manager is loaded"))?;
        self.stall_group = None;
        Ok(self.managers.get(&id).map_or(0, |m| m.local_l1_size))
    }

    pub(crate) fn remove(&mut self, manager: SubDeviceManagerId) -> Result<()> {
        if self.loaded == Some(manager.0) {
            return Err(Error::config(format!(
                "sub-device manager {} is still loaded",
                manager.0
            )));
        }
        self.managers
            .remove(&manager.0)
            .map(|_| ())
            .ok_or_else(|| Error::config(format!("unknown sub-device manager {}", manager.0)))
    }

    fn loaded_count(&self) -> Result<usize> {
        let id = self
            .loaded
            .ok_or_else(|| Error::config("no sub-device manager is loaded"))?;
        Ok(self.managers.get(&id).map_or(0, |m| m.sub_devices.len()))
    }

    pub(crate) fn check_sub_device(&self, sub_device: SubDeviceId) -> Result<()> {
        let count = self.loaded_count()?;
        if sub_device.0 >= count {
            return Err(Error::config(format!(
                "sub-device {} not in loaded manager ({count} sub-devices)",
                sub_device.0
            )));
        }
        Ok(())
    }

    pub(crate) fn set_stall_group(&mut self, group: &[SubDeviceId]) -> Result<()> {
        for &id in group {
            self.check_sub_device(id)?;
        }
        self.stall_group = Some(group.to_vec());
        log::trace!("Stall group set to {group:?}");
        Ok(())
    }

    pub(crate) fn reset_stall_group(&mut self) -> Result<()> {
        self.loaded_count()?;
        self.stall_group = None;
        Ok(())
    }

    pub(crate) fn stall_group(&self) -> Option<&[SubDeviceId]> {
        self.stall_group.as_deref()
    }

    pub(crate) fn loaded(&self) -> Option<SubDeviceManagerId> {
        self.loaded.map(SubDeviceManagerId)
    }
}
