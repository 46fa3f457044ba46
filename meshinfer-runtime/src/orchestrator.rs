//! Device-level setup and teardown around a generation session.
//!
//! On a multi-chip mesh with async collectives the worker grid is split
//! into a compute sub-device and a one-column CCL sub-device, the
//! persistent fabric is brought up and a global semaphore is placed on the
//! CCL cores. Teardown undoes all of it in reverse before closing the mesh.

use meshinfer::{
    CollectiveSetup, CoreCoord, CoreRange, CoreRangeSet, Error, GlobalSemaphore, MeshControl,
    Result, SubDevice, SubDeviceId, SubDeviceManagerId, Topology,
};

/// How collectives are run on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Run collectives asynchronously on their own sub-device.
    pub async_collectives: bool,
    pub topology: Topology,
    /// Per-core L1 the sub-device manager reserves.
    pub local_l1_size: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            async_collectives: true,
            topology: Topology::Linear,
            local_l1_size: 0,
        }
    }
}

/// Sub-device ids in the loaded manager.
pub const COMPUTE_SUB_DEVICE: SubDeviceId = SubDeviceId(0);
pub const CCL_SUB_DEVICE: SubDeviceId = SubDeviceId(1);

/// Owns an open mesh and the sub-device and fabric state set up on it.
pub struct Orchestrator<M: MeshControl> {
    mesh: M,
    manager: Option<SubDeviceManagerId>,
    ccl: CollectiveSetup<M::Semaphore>,
    closed: bool,
}

impl<M: MeshControl> Orchestrator<M> {
    /// Enable the program cache and, when collectives are async and the
    /// mesh has more than one chip, set up the CCL sub-device, the fabric
    /// and the collective semaphore.
    ///
    /// # Errors
    /// Returns a configuration error if the worker grid is too narrow to
    /// split, a device error if the semaphore lands at different addresses
    /// on different chips, or the mesh's own error for any failed step.
    pub fn new(mesh: M, options: OrchestratorOptions) -> Result<Self> {
        mesh.enable_program_cache();
        let shape = mesh.shape();
        let mut orchestrator = Self {
            mesh,
            manager: None,
            ccl: CollectiveSetup::sync(options.topology),
            closed: false,
        };
        if shape.num_devices() > 1 && options.async_collectives {
            orchestrator.setup_ccl(options)?;
        }
        log::info!(
            "Mesh {shape} ready: {} command queues, {} collectives",
            orchestrator.mesh.num_command_queues(),
            if orchestrator.ccl.is_async() { "async" } else { "sync" }
        );
        Ok(orchestrator)
    }

    fn setup_ccl(&mut self, options: OrchestratorOptions) -> Result<()> {
        let grid = self.mesh.compute_grid();
        if grid.x < 2 || grid.y == 0 {
            return Err(Error::config(format!(
                "compute grid {}x{} is too narrow to split off a CCL column",
                grid.x, grid.y
            )));
        }
        let compute = CoreRangeSet::single(CoreRange::new(
            CoreCoord::new(0, 0),
            CoreCoord::new(grid.x - 2, grid.y - 1),
        ));
        let ccl_cores = CoreRangeSet::single(CoreRange::new(
            CoreCoord::new(grid.x - 1, 0),
            CoreCoord::new(grid.x - 1, grid.y - 1),
        ));
        let manager = self.mesh.create_sub_device_manager(
            &[
                SubDevice { cores: compute },
                SubDevice {
                    cores: ccl_cores.clone(),
                },
            ],
            options.local_l1_size,
        )?;
        self.mesh.load_sub_device_manager(manager)?;
        self.manager = Some(manager);
        self.mesh.set_sub_device_stall_group(&[COMPUTE_SUB_DEVICE])?;
        self.mesh.enable_persistent_fabric()?;

        let semaphore = self.mesh.create_global_semaphore(&ccl_cores, 0)?;
        self.mesh.reset_global_semaphore(&semaphore, 0)?;
        let addresses = semaphore.addresses();
        if addresses.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::Device(format!(
                "global semaphore addresses differ across devices: {addresses:?}"
            )));
        }
        log::debug!(
            "CCL sub-device on column {}, semaphore at {:#x}",
            grid.x - 1,
            addresses.first().copied().unwrap_or(0)
        );
        self.ccl = CollectiveSetup {
            topology: options.topology,
            semaphore: Some(semaphore),
            sub_device: Some(CCL_SUB_DEVICE),
        };
        Ok(())
    }

    #[must_use]
    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    /// Collective configuration for models and the decode trace.
    #[must_use]
    pub fn collectives(&self) -> CollectiveSetup<M::Semaphore> {
        self.ccl.clone()
    }

    #[must_use]
    pub fn has_sub_devices(&self) -> bool {
        self.manager.is_some()
    }

    /// Wait for all outstanding work, collectives included.
    ///
    /// # Errors
    /// Returns the first failure of the drained work.
    pub fn synchronize(&self) -> Result<()> {
        if self.manager.is_none() {
            return self.mesh.synchronize();
        }
        self.mesh
            .set_sub_device_stall_group(&[COMPUTE_SUB_DEVICE, CCL_SUB_DEVICE])?;
        let synced = self.mesh.synchronize();
        self.mesh.set_sub_device_stall_group(&[COMPUTE_SUB_DEVICE])?;
        synced
    }

    /// Reset the stall group, tear down the fabric, unload the sub-devices
    /// and close the mesh. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns the first failing step; later steps are skipped.
    pub fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(manager) = self.manager.take() {
            self.mesh.synchronize()?;
            self.mesh.reset_sub_device_stall_group()?;
            self.mesh.teardown_persistent_fabric()?;
            self.mesh.clear_loaded_sub_device_manager()?;
            self.mesh.remove_sub_device_manager(manager)?;
        }
        self.mesh.close()?;
        log::info!("Mesh {} closed", self.mesh.shape());
        Ok(())
    }
}

impl<M: MeshControl> Drop for Orchestrator<M> {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!("Orchestrator dropped without teardown; closing the mesh");
            if let Err(e) = self.teardown() {
                log::warn!("Teardown on drop failed: {e}");
            }
        }
    }
}
