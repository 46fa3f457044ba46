//! The simulated mesh: allocation, command queues, events, traces and
//! sub-device control.
//!
//! Execution is lazy. Ops are validated and queued when issued; queued
//! commands only run when the host blocks on something (a blocking read or
//! write, an event, `synchronize`, a blocking trace replay), or on every
//! enqueue when the mesh was opened with `async_mode = false`. While
//! pumping, the transfer queue is always given the first chance to run, so
//! any read or write that is not fenced by an event races ahead of compute.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use meshinfer::backend::MeshControl;
use meshinfer::mesh::{
    CoreRangeSet, MeshShape, QueueId, SubDevice, SubDeviceId, SubDeviceManagerId, TraceId,
};
use meshinfer::tensor::{padded_shape, CoreGrid, TensorSpec};
use meshinfer::{Error, Result};

use crate::config::MeshConfig;
use crate::memory::{BufferId, DeviceMemory, MemoryUsage, Region};
use crate::queue::{Command, CommandQueue, EventState, Op};
use crate::sub_device::{check_in_grid, SimSemaphore, SubDeviceState};
use crate::tensor::{BufferRef, SimTensor};
use crate::trace::{Capture, Trace};

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(0);

/// L1 bytes each global semaphore takes per core.
const SEMAPHORE_BYTES_PER_CORE: usize = 16;

/// Event handle of a [`SimMesh`].
#[derive(Debug, Clone)]
pub struct SimEvent {
    mesh_id: u64,
    index: usize,
}

pub(crate) struct MeshState {
    pub(crate) memory: DeviceMemory,
    queues: Vec<CommandQueue>,
    events: Vec<EventState>,
    traces: HashMap<u32, Trace>,
    trace_bytes: usize,
    next_trace: u32,
    capture: Option<Capture>,
    program_cache_enabled: bool,
    programs: HashSet<String>,
    compiles: usize,
    sub_devices: SubDeviceState,
    record_log: bool,
    log: Vec<String>,
    closed: bool,
}

impl MeshState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Device("mesh is closed".into()));
        }
        Ok(())
    }

    fn check_queue(&self, queue: QueueId) -> Result<()> {
        if queue.0 >= self.queues.len() {
            return Err(Error::config(format!(
                "{queue} does not exist: mesh has {} command queues",
                self.queues.len()
            )));
        }
        Ok(())
    }

    fn capturing(&self, queue: QueueId) -> bool {
        self.capture.as_ref().is_some_and(|c| c.queue == queue)
    }

    fn compile(&mut self, program: &str) {
        if !self.program_cache_enabled {
            self.compiles += 1;
            return;
        }
        if self.programs.insert(program.to_string()) {
            self.compiles += 1;
            log::debug!("Compiled program {program}");
        }
    }

    /// Run one ready command, preferring the highest-numbered queue.
    fn step(&mut self) -> Result<bool> {
        for q in (0..self.queues.len()).rev() {
            if !self.queues[q].head_ready(&self.events) {
                continue;
            }
            let Some(command) = self.queues[q].pop() else {
                continue;
            };
            self.execute(QueueId(q), command)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn execute(&mut self, queue: QueueId, command: Command) -> Result<()> {
        if self.record_log {
            self.log.push(format!("{queue} {}", command.describe()));
        }
        match command {
            Command::Op(op) => (op.run)(&mut self.memory),
            Command::Record { event, value } => {
                if let Some(e) = self.events.get_mut(event) {
                    e.completed = e.completed.max(value);
                }
                Ok(())
            }
            Command::Wait { .. } => Ok(()),
            Command::Replay { trace } => {
                let captured = self.traces.get(&trace).ok_or_else(|| Error::TraceInvalidated {
                    trace,
                    reason: "trace was released before its replay ran".into(),
                })?;
                captured.replay(trace, &mut self.memory)
            }
        }
    }

    fn queues_idle(&self) -> bool {
        self.queues.iter().all(CommandQueue::is_empty)
    }

    fn describe_queues(&self) -> String {
        self.queues
            .iter()
            .enumerate()
            .map(|(q, queue)| match queue.front() {
                None => format!("cq{q} empty"),
                Some(head) => format!("cq{q} {} pending, head {}", queue.len(), head.describe()),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub(crate) struct MeshInner {
    id: u64,
    config: MeshConfig,
    state: RefCell<MeshState>,
    pending_frees: RefCell<Vec<BufferId>>,
}

impl MeshInner {
    pub(crate) fn defer_free(&self, id: BufferId) {
        self.pending_frees.borrow_mut().push(id);
    }
}

/// Handle to an open simulated mesh. Clones share the mesh.
#[derive(Clone)]
pub struct SimMesh {
    inner: Rc<MeshInner>,
}

impl std::fmt::Debug for SimMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMesh")
            .field("id", &self.inner.id)
            .field("grid", &self.inner.config.device_grid)
            .finish_non_exhaustive()
    }
}

impl SimMesh {
    /// Open a mesh, reserving the trace region out of each device's DRAM.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn open(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let num_devices = config.device_grid.num_devices();
        let memory = DeviceMemory::new(
            num_devices,
            config.dram_size - config.trace_region_size,
            config.l1_size(),
        );
        let state = MeshState {
            memory,
            queues: (0..config.num_command_queues)
                .map(|_| CommandQueue::default())
                .collect(),
            events: Vec::new(),
            traces: HashMap::new(),
            trace_bytes: 0,
            next_trace: 0,
            capture: None,
            program_cache_enabled: false,
            programs: HashSet::new(),
            compiles: 0,
            sub_devices: SubDeviceState::default(),
            record_log: config.record_log,
            log: Vec::new(),
            closed: false,
        };
        log::info!(
            "Opened simulated {} mesh ({num_devices} devices, {} command queues, trace region {} bytes)",
            config.device_grid,
            config.num_command_queues,
            config.trace_region_size
        );
        Ok(Self {
            inner: Rc::new(MeshInner {
                id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: RefCell::new(state),
                pending_frees: RefCell::new(Vec::new()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.inner.config.device_grid.num_devices()
    }

    /// Current per-device memory usage.
    #[must_use]
    pub fn memory_usage(&self) -> MemoryUsage {
        self.collect_garbage();
        self.inner.state.borrow().memory.usage()
    }

    /// Programs compiled so far, counting every recompile when the program
    /// cache is off.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.inner.state.borrow().compiles
    }

    /// Executed commands as `"cq<N> <command>"`, oldest first. Empty unless
    /// the mesh was opened with `record_log`.
    #[must_use]
    pub fn command_log(&self) -> Vec<String> {
        self.inner.state.borrow().log.clone()
    }

    pub fn clear_command_log(&self) {
        self.inner.state.borrow_mut().log.clear();
    }

    /// Commands waiting on `queue`.
    #[must_use]
    pub fn pending_commands(&self, queue: QueueId) -> usize {
        self.inner
            .state
            .borrow()
            .queues
            .get(queue.0)
            .map_or(0, CommandQueue::len)
    }

    #[must_use]
    pub fn loaded_sub_device_manager(&self) -> Option<SubDeviceManagerId> {
        self.inner.state.borrow().sub_devices.loaded()
    }

    #[must_use]
    pub fn stall_group(&self) -> Option<Vec<SubDeviceId>> {
        self.inner
            .state
            .borrow()
            .sub_devices
            .stall_group()
            .map(<[SubDeviceId]>::to_vec)
    }

    #[must_use]
    pub fn fabric_enabled(&self) -> bool {
        self.inner.state.borrow().sub_devices.fabric_enabled
    }

    /// Bytes of the trace region held by live traces.
    #[must_use]
    pub fn trace_region_used(&self) -> usize {
        self.inner.state.borrow().trace_bytes
    }

    pub(crate) fn mesh_id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn is_live(&self, id: BufferId) -> bool {
        self.inner.state.borrow().memory.is_live(id)
    }

    fn collect_garbage(&self) {
        let ids = std::mem::take(&mut *self.inner.pending_frees.borrow_mut());
        if ids.is_empty() {
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        for id in ids {
            state.memory.free(id);
        }
    }

    /// Allocate a zero-filled tensor.
    pub(crate) fn allocate(&self, shape: &[usize], spec: TensorSpec, label: &str) -> Result<SimTensor> {
        let grid = self.inner.config.device_grid;
        spec.validate(shape, grid)?;
        let local = spec.mapping.local_shape(shape, grid)?;
        let len = local.iter().product();
        let bytes = spec
            .dtype
            .bytes_for(padded_shape(&local, spec.layout).iter().product());
        let region = if spec.memory.is_l1() {
            Region::L1
        } else {
            Region::Dram
        };
        self.collect_garbage();
        let id = {
            let mut state = self.inner.state.borrow_mut();
            state.check_open()?;
            state.memory.allocate(label, region, bytes, spec.dtype, len)?
        };
        let buffer = Rc::new(BufferRef::new(id, Rc::downgrade(&self.inner)));
        Ok(SimTensor::new(self.clone(), buffer, shape.to_vec(), local, spec))
    }

    /// Force-free a buffer while handles to it may remain.
    pub(crate) fn free_now(&self, id: BufferId) {
        let mut state = self.inner.state.borrow_mut();
        if state.memory.free(id) {
            log::debug!("Deallocated buffer {id}");
        }
    }

    /// Queue an op, or add it to the capture in progress on `queue`.
    pub(crate) fn enqueue(&self, queue: QueueId, op: Op) -> Result<()> {
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            state.check_open()?;
            state.check_queue(queue)?;
            if let Some(capture) = state.capture.as_mut().filter(|c| c.queue == queue) {
                let Some(program) = &op.program else {
                    return Err(Error::Device(format!(
                        "{} cannot be captured into trace {}",
                        op.name, capture.trace
                    )));
                };
                if !state.program_cache_enabled || !state.programs.contains(program) {
                    return Err(Error::ProgramNotCompiled(program.clone()));
                }
                capture.ops.push(Rc::new(op));
                return Ok(());
            }
            if let Some(program) = &op.program {
                state.compile(program);
            }
            state.queues[queue.0].push(Command::Op(Rc::new(op)));
        }
        self.after_enqueue()
    }

    fn push_command(&self, queue: QueueId, command: Command) -> Result<()> {
        self.inner.state.borrow_mut().queues[queue.0].push(command);
        self.after_enqueue()
    }

    fn after_enqueue(&self) -> Result<()> {
        if self.inner.config.async_mode {
            return Ok(());
        }
        loop {
            self.collect_garbage();
            if !self.inner.state.borrow_mut().step()? {
                return Ok(());
            }
        }
    }

    /// Run queued commands until `done` holds.
    pub(crate) fn pump_until(
        &self,
        what: &str,
        mut done: impl FnMut(&MeshState) -> bool,
    ) -> Result<()> {
        loop {
            self.collect_garbage();
            let mut state = self.inner.state.borrow_mut();
            if done(&state) {
                return Ok(());
            }
            if !state.step()? {
                return Err(Error::QueueStalled(format!(
                    "{what}: {}",
                    state.describe_queues()
                )));
            }
        }
    }

    pub(crate) fn check_semaphore(&self, semaphore: &SimSemaphore) -> Result<()> {
        if semaphore.mesh_id != self.inner.id {
            return Err(Error::config("global semaphore belongs to another mesh"));
        }
        Ok(())
    }

    /// Host-side checks for an async collective's plumbing.
    pub(crate) fn check_collective(
        &self,
        semaphore: Option<&SimSemaphore>,
        sub_device: Option<SubDeviceId>,
    ) -> Result<()> {
        let state = self.inner.state.borrow();
        if let Some(semaphore) = semaphore {
            if semaphore.mesh_id != self.inner.id {
                return Err(Error::config("global semaphore belongs to another mesh"));
            }
            if !state.sub_devices.fabric_enabled {
                return Err(Error::Device(
                    "async collective issued without the persistent fabric".into(),
                ));
            }
        }
        if let Some(sub_device) = sub_device {
            state.sub_devices.check_sub_device(sub_device)?;
        }
        Ok(())
    }

    fn check_event(&self, event: &SimEvent) -> Result<()> {
        if event.mesh_id != self.inner.id {
            return Err(Error::config("event belongs to another mesh"));
        }
        Ok(())
    }
}

impl MeshControl for SimMesh {
    type Event = SimEvent;
    type Semaphore = SimSemaphore;

    fn shape(&self) -> MeshShape {
        self.inner.config.device_grid
    }

    fn num_command_queues(&self) -> usize {
        self.inner.config.num_command_queues
    }

    fn compute_grid(&self) -> CoreGrid {
        self.inner.config.compute_grid
    }

    fn enable_program_cache(&self) {
        self.inner.state.borrow_mut().program_cache_enabled = true;
        log::debug!("Program cache enabled");
    }

    fn program_cache_entries(&self) -> usize {
        self.inner.state.borrow().programs.len()
    }

    fn create_event(&self) -> SimEvent {
        let mut state = self.inner.state.borrow_mut();
        state.events.push(EventState::default());
        SimEvent {
            mesh_id: self.inner.id,
            index: state.events.len() - 1,
        }
    }

    fn record_event(&self, queue: QueueId, event: &SimEvent) -> Result<()> {
        self.check_event(event)?;
        let command = {
            let mut state = self.inner.state.borrow_mut();
            state.check_open()?;
            state.check_queue(queue)?;
            if state.capturing(queue) {
                return Err(Error::Device(format!(
                    "cannot record an event on {queue} during trace capture"
                )));
            }
            let slot = &mut state.events[event.index];
            slot.issued += 1;
            Command::Record {
                event: event.index,
                value: slot.issued,
            }
        };
        self.push_command(queue, command)
    }

    fn wait_for_event(&self, queue: QueueId, event: &SimEvent) -> Result<()> {
        self.check_event(event)?;
        let command = {
            let state = self.inner.state.borrow();
            state.check_open()?;
            state.check_queue(queue)?;
            if state.capturing(queue) {
                return Err(Error::Device(format!(
                    "cannot wait for an event on {queue} during trace capture"
                )));
            }
            Command::Wait {
                event: event.index,
                value: state.events[event.index].issued,
            }
        };
        self.push_command(queue, command)
    }

    fn event_synchronize(&self, event: &SimEvent) -> Result<()> {
        self.check_event(event)?;
        let index = event.index;
        let target = self.inner.state.borrow().events[index].issued;
        self.pump_until(&format!("event {index}"), |state| {
            state.events[index].completed >= target
        })
    }

    fn synchronize(&self) -> Result<()> {
        if let Some(group) = self.stall_group() {
            log::trace!("synchronize on stall group {group:?}");
        }
        self.pump_until("synchronize", MeshState::queues_idle)
    }

    fn begin_trace_capture(&self, queue: QueueId) -> Result<TraceId> {
        let mut state = self.inner.state.borrow_mut();
        state.check_open()?;
        state.check_queue(queue)?;
        if let Some(capture) = &state.capture {
            return Err(Error::Device(format!(
                "trace {} is still being captured",
                capture.trace
            )));
        }
        let trace = state.next_trace;
        state.next_trace += 1;
        state.capture = Some(Capture {
            trace,
            queue,
            ops: Vec::new(),
        });
        log::debug!("Begin trace capture {trace} on {queue}");
        Ok(TraceId(trace))
    }

    fn end_trace_capture(&self, queue: QueueId, trace: TraceId) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        match &state.capture {
            Some(c) if c.trace == trace.0 && c.queue == queue => {}
            _ => {
                return Err(Error::Device(format!(
                    "trace {} is not being captured on {queue}",
                    trace.0
                )))
            }
        }
        let Some(capture) = state.capture.take() else {
            return Err(Error::Device("no capture in progress".into()));
        };
        let captured = Trace::from_capture(capture);
        let available = self
            .inner
            .config
            .trace_region_size
            .saturating_sub(state.trace_bytes);
        if captured.bytes > available {
            return Err(Error::OutOfMemory {
                what: format!("trace {} in the trace region", trace.0),
                requested: captured.bytes,
                available,
            });
        }
        log::info!(
            "Captured trace {}: {} programs, {} bytes",
            trace.0,
            captured.ops.len(),
            captured.bytes
        );
        state.trace_bytes += captured.bytes;
        state.traces.insert(trace.0, captured);
        Ok(())
    }

    fn execute_trace(&self, queue: QueueId, trace: TraceId, blocking: bool) -> Result<()> {
        self.collect_garbage();
        {
            let mut state = self.inner.state.borrow_mut();
            state.check_open()?;
            state.check_queue(queue)?;
            if state.capturing(queue) {
                return Err(Error::Device(format!(
                    "cannot replay trace {} while capturing on {queue}",
                    trace.0
                )));
            }
            let captured = state
                .traces
                .get(&trace.0)
                .ok_or_else(|| Error::Device(format!("unknown trace {}", trace.0)))?;
            if captured.queue != queue {
                log::warn!(
                    "Trace {} captured on {} replayed on {queue}",
                    trace.0,
                    captured.queue
                );
            }
            captured.check_live(trace.0, &state.memory)?;
            state.queues[queue.0].push(Command::Replay { trace: trace.0 });
        }
        if blocking {
            self.pump_until(&format!("trace {}", trace.0), |state| {
                state.queues[queue.0].is_empty()
            })
        } else {
            self.after_enqueue()
        }
    }

    fn release_trace(&self, trace: TraceId) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let captured = state
            .traces
            .remove(&trace.0)
            .ok_or_else(|| Error::Device(format!("unknown trace {}", trace.0)))?;
        state.trace_bytes -= captured.bytes;
        log::debug!("Released trace {}", trace.0);
        Ok(())
    }

    fn create_sub_device_manager(
        &self,
        sub_devices: &[SubDevice],
        local_l1_size: usize,
    ) -> Result<SubDeviceManagerId> {
        let grid = self.inner.config.compute_grid;
        self.inner
            .state
            .borrow_mut()
            .sub_devices
            .create_manager(sub_devices, local_l1_size, grid)
    }

    fn load_sub_device_manager(&self, manager: SubDeviceManagerId) -> Result<()> {
        self.synchronize()?;
        let cores = self.inner.config.compute_grid.num_cores();
        let mut state = self.inner.state.borrow_mut();
        let local_l1 = state.sub_devices.load(manager)?;
        if let Err(e) = state
            .memory
            .reserve(Region::L1, local_l1 * cores, "sub-device local L1")
        {
            state.sub_devices.clear_loaded()?;
            return Err(e);
        }
        Ok(())
    }

    fn clear_loaded_sub_device_manager(&self) -> Result<()> {
        self.synchronize()?;
        let cores = self.inner.config.compute_grid.num_cores();
        let mut state = self.inner.state.borrow_mut();
        let local_l1 = state.sub_devices.clear_loaded()?;
        state.memory.release(Region::L1, local_l1 * cores);
        Ok(())
    }

    fn remove_sub_device_manager(&self, manager: SubDeviceManagerId) -> Result<()> {
        self.inner.state.borrow_mut().sub_devices.remove(manager)
    }

    fn set_sub_device_stall_group(&self, sub_devices: &[SubDeviceId]) -> Result<()> {
        self.inner
            .state
            .borrow_mut()
            .sub_devices
            .set_stall_group(sub_devices)
    }

    fn reset_sub_device_stall_group(&self) -> Result<()> {
        self.inner.state.borrow_mut().sub_devices.reset_stall_group()
    }

    fn create_global_semaphore(&self, cores: &CoreRangeSet, initial: u32) -> Result<SimSemaphore> {
        check_in_grid(cores, self.inner.config.compute_grid)?;
        let mut state = self.inner.state.borrow_mut();
        state.check_open()?;
        state.memory.reserve(
            Region::L1,
            SEMAPHORE_BYTES_PER_CORE * cores.num_cores(),
            "global semaphore",
        )?;
        let (index, address) = state.memory.alloc_semaphore(initial);
        Ok(SimSemaphore {
            mesh_id: self.inner.id,
            index,
            addresses: vec![address; self.num_devices()],
        })
    }

    fn reset_global_semaphore(&self, semaphore: &SimSemaphore, value: u32) -> Result<()> {
        self.check_semaphore(semaphore)?;
        self.inner
            .state
            .borrow_mut()
            .memory
            .set_semaphore(semaphore.index, value)
    }

    fn enable_persistent_fabric(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.sub_devices.fabric_enabled {
            return Err(Error::Device("persistent fabric is already enabled".into()));
        }
        state.sub_devices.fabric_enabled = true;
        log::debug!("Persistent fabric enabled");
        Ok(())
    }

    fn teardown_persistent_fabric(&self) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if !state.sub_devices.fabric_enabled {
            return Err(Error::Device("persistent fabric is not enabled".into()));
        }
        state.sub_devices.fabric_enabled = false;
        log::debug!("Persistent fabric torn down");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.inner.state.borrow().closed {
            return Ok(());
        }
        let drained = self.synchronize();
        let mut state = self.inner.state.borrow_mut();
        if state.sub_devices.fabric_enabled {
            log::warn!("Closing mesh with the persistent fabric still enabled");
        }
        state.capture = None;
        state.traces.clear();
        state.trace_bytes = 0;
        for queue in &mut state.queues {
            queue.clear();
        }
        state.memory.clear();
        state.closed = true;
        log::info!("Closed simulated {} mesh", self.inner.config.device_grid);
        drained
    }
}

#[cfg(test)]
mod tests {
    use meshinfer::dtype::DType;
    use meshinfer::mesh::{CoreCoord, CoreRange};
    use meshinfer::tensor::MemoryConfig;

    use super::*;

    fn logging_mesh() -> SimMesh {
        SimMesh::open(MeshConfig {
            record_log: true,
            ..MeshConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_dropped_tensor_frees_memory() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let before = mesh.memory_usage().dram_used;
        let t = mesh
            .allocate(&[1, 1, 32, 32], TensorSpec::new(DType::BF16), "t")
            .unwrap();
        assert_eq!(mesh.memory_usage().dram_used, before + 2048);
        drop(t);
        assert_eq!(mesh.memory_usage().dram_used, before);
    }

    #[test]
    fn test_l1_allocation_is_accounted_separately() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let _t = mesh
            .allocate(
                &[1, 1, 32, 32],
                TensorSpec::new(DType::F32).with_memory(MemoryConfig::L1),
                "t",
            )
            .unwrap();
        let usage = mesh.memory_usage();
        assert_eq!(usage.l1_used, 4096);
        assert_eq!(usage.dram_used, 0);
    }

    #[test]
    fn test_wait_without_record_is_noop() {
        let mesh = logging_mesh();
        let event = mesh.create_event();
        mesh.wait_for_event(QueueId::COMPUTE, &event).unwrap();
        mesh.synchronize().unwrap();
        assert_eq!(mesh.command_log(), vec!["cq0 wait event 0"]);
    }

    #[test]
    fn test_cross_queue_wait_orders_commands() {
        let mesh = logging_mesh();
        let a = mesh.create_event();
        let b = mesh.create_event();
        mesh.record_event(QueueId::COMPUTE, &a).unwrap();
        mesh.wait_for_event(QueueId::TRANSFER, &a).unwrap();
        mesh.record_event(QueueId::TRANSFER, &b).unwrap();
        mesh.synchronize().unwrap();
        assert_eq!(
            mesh.command_log(),
            vec!["cq0 record event 0", "cq1 wait event 0", "cq1 record event 1"]
        );
    }

    #[test]
    fn test_transfer_queue_runs_first_without_events() {
        let mesh = logging_mesh();
        let a = mesh.create_event();
        let b = mesh.create_event();
        mesh.record_event(QueueId::COMPUTE, &a).unwrap();
        mesh.record_event(QueueId::TRANSFER, &b).unwrap();
        mesh.synchronize().unwrap();
        assert_eq!(
            mesh.command_log(),
            vec!["cq1 record event 1", "cq0 record event 0"]
        );
    }

    #[test]
    fn test_event_synchronize_runs_only_what_it_needs() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        let a = mesh.create_event();
        let b = mesh.create_event();
        mesh.record_event(QueueId::COMPUTE, &a).unwrap();
        mesh.record_event(QueueId::COMPUTE, &b).unwrap();
        mesh.event_synchronize(&a).unwrap();
        assert_eq!(mesh.pending_commands(QueueId::COMPUTE), 1);
        mesh.synchronize().unwrap();
        assert_eq!(mesh.pending_commands(QueueId::COMPUTE), 0);
    }

    #[test]
    fn test_trace_capture_requires_compiled_programs() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        mesh.enable_program_cache();
        let trace = mesh.begin_trace_capture(QueueId::COMPUTE).unwrap();
        let op = Op {
            name: "noop",
            program: Some("noop()".into()),
            buffers: Vec::new(),
            run: Box::new(|_: &mut DeviceMemory| Ok(())),
        };
        let err = mesh.enqueue(QueueId::COMPUTE, op).unwrap_err();
        assert!(matches!(err, Error::ProgramNotCompiled(_)));
        mesh.end_trace_capture(QueueId::COMPUTE, trace).unwrap();
    }

    #[test]
    fn test_trace_region_overflow_is_oom() {
        let mesh = SimMesh::open(MeshConfig {
            trace_region_size: 1024,
            ..MeshConfig::default()
        })
        .unwrap();
        mesh.enable_program_cache();
        let noop = || Op {
            name: "noop",
            program: Some("noop()".into()),
            buffers: Vec::new(),
            run: Box::new(|_: &mut DeviceMemory| Ok(())),
        };
        mesh.enqueue(QueueId::COMPUTE, noop()).unwrap();
        let trace = mesh.begin_trace_capture(QueueId::COMPUTE).unwrap();
        mesh.enqueue(QueueId::COMPUTE, noop()).unwrap();
        let err = mesh.end_trace_capture(QueueId::COMPUTE, trace).unwrap_err();
        assert_eq!(err.kind(), meshinfer::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_semaphores_and_fabric() {
        let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        let cores = CoreRangeSet::single(CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(7, 7)));
        let a = mesh.create_global_semaphore(&cores, 0).unwrap();
        let b = mesh.create_global_semaphore(&cores, 0).unwrap();
        assert_eq!(meshinfer::GlobalSemaphore::addresses(&a).len(), 2);
        assert_ne!(a.addresses[0], b.addresses[0]);

        assert!(mesh.check_collective(Some(&a), None).is_err());
        mesh.enable_persistent_fabric().unwrap();
        mesh.check_collective(Some(&a), None).unwrap();
        assert!(mesh.enable_persistent_fabric().is_err());
        mesh.teardown_persistent_fabric().unwrap();

        let other = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
        assert!(other.reset_global_semaphore(&a, 0).is_err());
    }

    #[test]
    fn test_close_rejects_further_work() {
        let mesh = SimMesh::open(MeshConfig::default()).unwrap();
        mesh.close().unwrap();
        assert!(mesh
            .allocate(&[32], TensorSpec::new(DType::F32), "t")
            .is_err());
    }
}
