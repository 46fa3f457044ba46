//! Commands held by the simulated command queues.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use meshinfer::Result;

use crate::memory::DeviceMemory;
use crate::tensor::BufferRef;

pub(crate) type KernelFn = Box<dyn Fn(&mut DeviceMemory) -> Result<()>>;

/// A single device program or transfer.
pub(crate) struct Op {
    pub name: &'static str,
    /// Program cache key; `None` for host transfers, which cannot be traced.
    pub program: Option<String>,
    /// Keeps every buffer the op touches alive until it has run.
    pub buffers: Vec<Rc<BufferRef>>,
    pub run: KernelFn,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("name", &self.name)
            .field("program", &self.program)
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Op(Rc<Op>),
    /// Mark `event` as reached its `value`-th record.
    Record { event: usize, value: u64 },
    /// Block the queue until `event` has reached `value`.
    Wait { event: usize, value: u64 },
    Replay { trace: u32 },
}

impl Command {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Op(op) => op.name.to_string(),
            Self::Record { event, .. } => format!("record event {event}"),
            Self::Wait { event, .. } => format!("wait event {event}"),
            Self::Replay { trace } => format!("replay trace {trace}"),
        }
    }
}

/// Record/completion counters of one event.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EventState {
    pub issued: u64,
    pub completed: u64,
}

/// An in-order command queue.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<Command>,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    pub(crate) fn front(&self) -> Option<&Command> {
        self.commands.front()
    }

    pub(crate) fn pop(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }

    /// Whether the head command can run given the current event state.
    pub(crate) fn head_ready(&self, events: &[EventState]) -> bool {
        match self.commands.front() {
            None => false,
            Some(Command::Wait { event, value }) => {
                events.get(*event).is_some_and(|e| e.completed >= *value)
            }
            Some(_) => true,
        }
    }
}
