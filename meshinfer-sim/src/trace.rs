//! Captured command sequences.

use std::rc::Rc;

use meshinfer::mesh::QueueId;
use meshinfer::{Error, Result};

use crate::memory::DeviceMemory;
use crate::queue::Op;

/// Trace-region bytes one captured program occupies on each device.
pub(crate) const TRACE_BYTES_PER_OP: usize = 16 << 10;

/// A capture in progress.
#[derive(Debug)]
pub(crate) struct Capture {
    pub trace: u32,
    pub queue: QueueId,
    pub ops: Vec<Rc<Op>>,
}

/// A finished trace. Holds its ops, and through them every buffer address
/// it was captured against.
#[derive(Debug)]
pub(crate) struct Trace {
    pub queue: QueueId,
    pub ops: Vec<Rc<Op>>,
    pub bytes: usize,
}

impl Trace {
    pub(crate) fn from_capture(capture: Capture) -> Self {
        let bytes = capture.ops.len() * TRACE_BYTES_PER_OP;
        Self {
            queue: capture.queue,
            ops: capture.ops,
            bytes,
        }
    }

    /// Fails if any bound buffer was freed after capture.
    pub(crate) fn check_live(&self, id: u32, memory: &DeviceMemory) -> Result<()> {
        for op in &self.ops {
            for buffer in &op.buffers {
                if !memory.is_live(buffer.id) {
                    return Err(Error::TraceInvalidated {
                        trace: id,
                        reason: format!(
                            "buffer {} used by {} was deallocated after capture",
                            buffer.id, op.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn replay(&self, id: u32, memory: &mut DeviceMemory) -> Result<()> {
        self.check_live(id, memory)?;
        for op in &self.ops {
            (op.run)(memory)?;
        }
        Ok(())
    }
}
