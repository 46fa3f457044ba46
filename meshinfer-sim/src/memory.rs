//! Per-device buffer storage and capacity accounting.
//!
//! Every chip of a mesh holds the same set of buffers, each with its own
//! local contents. Allocations are symmetric, so one usage counter per
//! region describes every device.

use std::collections::HashMap;
use std::ops::Range;

use meshinfer::dtype::DType;
use meshinfer::host::HostData;
use meshinfer::{Error, Result};

use crate::index::{gather_block, scatter_block};

pub(crate) type BufferId = u64;

/// Base of the per-chip L1 window used for global semaphores.
pub(crate) const SEMAPHORE_BASE: usize = 0x1_0000;
const SEMAPHORE_STRIDE: usize = 16;

/// Local contents of a buffer on one device. Float dtypes are held as
/// `f32` after rounding to the buffer's element type.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

impl DeviceData {
    pub(crate) fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::I32 => Self::I32(vec![0; len]),
            DType::U32 => Self::U32(vec![0; len]),
            _ => Self::F32(vec![0.0; len]),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    pub(crate) fn class(&self) -> &'static str {
        match self {
            Self::F32(_) => "f32",
            Self::I32(_) => "i32",
            Self::U32(_) => "u32",
        }
    }

    pub(crate) fn from_host(data: HostData) -> Self {
        match data {
            HostData::F32(v) => Self::F32(v),
            HostData::I32(v) => Self::I32(v),
            HostData::U32(v) => Self::U32(v),
        }
    }

    pub(crate) fn into_host(self) -> HostData {
        match self {
            Self::F32(v) => HostData::F32(v),
            Self::I32(v) => HostData::I32(v),
            Self::U32(v) => HostData::U32(v),
        }
    }

    /// Dense copy of the block `ranges` of a tensor shaped `shape`.
    pub(crate) fn gather(&self, shape: &[usize], ranges: &[Range<usize>]) -> Self {
        match self {
            Self::F32(v) => Self::F32(gather_block(v, shape, ranges)),
            Self::I32(v) => Self::I32(gather_block(v, shape, ranges)),
            Self::U32(v) => Self::U32(gather_block(v, shape, ranges)),
        }
    }

    /// Write `block` into the region `ranges` of this tensor shaped `shape`.
    pub(crate) fn scatter(
        &mut self,
        shape: &[usize],
        ranges: &[Range<usize>],
        block: &Self,
    ) -> Result<()> {
        match (self, block) {
            (Self::F32(dst), Self::F32(src)) => scatter_block(dst, shape, ranges, src),
            (Self::I32(dst), Self::I32(src)) => scatter_block(dst, shape, ranges, src),
            (Self::U32(dst), Self::U32(src)) => scatter_block(dst, shape, ranges, src),
            (dst, src) => {
                return Err(Error::DtypeMismatch {
                    expected: dst.class().into(),
                    got: src.class().into(),
                })
            }
        }
        Ok(())
    }
}

/// Which on-chip memory a buffer occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Region {
    Dram,
    L1,
}

impl Region {
    fn name(self) -> &'static str {
        match self {
            Self::Dram => "DRAM",
            Self::L1 => "L1",
        }
    }
}

struct Buffer {
    label: String,
    region: Region,
    bytes: usize,
    shards: Vec<DeviceData>,
}

/// Bytes in use and available per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub dram_used: usize,
    pub dram_capacity: usize,
    pub l1_used: usize,
    pub l1_capacity: usize,
    pub num_buffers: usize,
}

/// Buffers of every device plus the global semaphore words.
pub struct DeviceMemory {
    num_devices: usize,
    buffers: HashMap<BufferId, Buffer>,
    next_id: BufferId,
    dram_capacity: usize,
    l1_capacity: usize,
    dram_used: usize,
    l1_used: usize,
    semaphores: Vec<u32>,
}

impl DeviceMemory {
    pub(crate) fn new(num_devices: usize, dram_capacity: usize, l1_capacity: usize) -> Self {
        Self {
            num_devices,
            buffers: HashMap::new(),
            next_id: 0,
            dram_capacity,
            l1_capacity,
            dram_used: 0,
            l1_used: 0,
            semaphores: Vec::new(),
        }
    }

    pub(crate) fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            dram_used: self.dram_used,
            dram_capacity: self.dram_capacity,
            l1_used: self.l1_used,
            l1_capacity: self.l1_capacity,
            num_buffers: self.buffers.len(),
        }
    }

    /// Claim `bytes` of `region` on every device without creating a buffer.
    pub(crate) fn reserve(&mut self, region: Region, bytes: usize, what: &str) -> Result<()> {
        let (used, capacity) = match region {
            Region::Dram => (&mut self.dram_used, self.dram_capacity),
            Region::L1 => (&mut self.l1_used, self.l1_capacity),
        };
        let available = capacity.saturating_sub(*used);
        if bytes > available {
            return Err(Error::OutOfMemory {
                what: format!("{what} in {} of each of {} devices", region.name(), self.num_devices),
                requested: bytes,
                available,
            });
        }
        *used += bytes;
        Ok(())
    }

    pub(crate) fn release(&mut self, region: Region, bytes: usize) {
        match region {
            Region::Dram => self.dram_used = self.dram_used.saturating_sub(bytes),
            Region::L1 => self.l1_used = self.l1_used.saturating_sub(bytes),
        }
    }

    /// Allocate a zero-filled buffer of `len` elements per device.
    pub(crate) fn allocate(
        &mut self,
        label: &str,
        region: Region,
        bytes: usize,
        dtype: DType,
        len: usize,
    ) -> Result<BufferId> {
        self.reserve(region, bytes, label)?;
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(
            id,
            Buffer {
                label: label.to_string(),
                region,
                bytes,
                shards: (0..self.num_devices)
                    .map(|_| DeviceData::zeros(dtype, len))
                    .collect(),
            },
        );
        log::trace!("alloc buffer {id} ({label}): {bytes} bytes of {}", region.name());
        Ok(id)
    }

    /// Free a buffer; returns false if it was already gone.
    pub(crate) fn free(&mut self, id: BufferId) -> bool {
        match self.buffers.remove(&id) {
            Some(buffer) => {
                self.release(buffer.region, buffer.bytes);
                log::trace!("free buffer {id} ({})", buffer.label);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_live(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub(crate) fn label(&self, id: BufferId) -> Option<&str> {
        self.buffers.get(&id).map(|b| b.label.as_str())
    }

    fn buffer(&self, id: BufferId) -> Result<&Buffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| Error::Device(format!("buffer {id} was deallocated")))
    }

    pub(crate) fn data(&self, id: BufferId, device: usize) -> Result<&DeviceData> {
        self.buffer(id)?
            .shards
            .get(device)
            .ok_or_else(|| Error::Device(format!("device {device} out of range")))
    }

    pub(crate) fn data_mut(&mut self, id: BufferId, device: usize) -> Result<&mut DeviceData> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| Error::Device(format!("buffer {id} was deallocated")))?
            .shards
            .get_mut(device)
            .ok_or_else(|| Error::Device(format!("device {device} out of range")))
    }

    pub(crate) fn f32(&self, id: BufferId, device: usize) -> Result<&[f32]> {
        match self.data(id, device)? {
            DeviceData::F32(v) => Ok(v),
            other => Err(class_mismatch("f32", other)),
        }
    }

    pub(crate) fn i32(&self, id: BufferId, device: usize) -> Result<&[i32]> {
        match self.data(id, device)? {
            DeviceData::I32(v) => Ok(v),
            other => Err(class_mismatch("i32", other)),
        }
    }

    pub(crate) fn u32(&self, id: BufferId, device: usize) -> Result<&[u32]> {
        match self.data(id, device)? {
            DeviceData::U32(v) => Ok(v),
            other => Err(class_mismatch("u32", other)),
        }
    }

    pub(crate) fn f32_mut(&mut self, id: BufferId, device: usize) -> Result<&mut Vec<f32>> {
        match self.data_mut(id, device)? {
            DeviceData::F32(v) => Ok(v),
            other => Err(class_mismatch("f32", other)),
        }
    }

    pub(crate) fn i32_mut(&mut self, id: BufferId, device: usize) -> Result<&mut Vec<i32>> {
        match self.data_mut(id, device)? {
            DeviceData::I32(v) => Ok(v),
            other => Err(class_mismatch("i32", other)),
        }
    }

    /// Replace one device's contents; the length must not change.
    pub(crate) fn store(&mut self, id: BufferId, device: usize, data: DeviceData) -> Result<()> {
        let slot = self.data_mut(id, device)?;
        if slot.len() != data.len() {
            return Err(Error::Device(format!(
                "buffer {id} holds {} elements, write has {}",
                slot.len(),
                data.len()
            )));
        }
        *slot = data;
        Ok(())
    }

    /// Allocate a semaphore word; returns its index and L1 address.
    pub(crate) fn alloc_semaphore(&mut self, initial: u32) -> (usize, usize) {
        let index = self.semaphores.len();
        self.semaphores.push(initial);
        (index, SEMAPHORE_BASE + index * SEMAPHORE_STRIDE)
    }

    pub(crate) fn semaphore(&self, index: usize) -> Result<u32> {
        self.semaphores
            .get(index)
            .copied()
            .ok_or_else(|| Error::Device(format!("unknown semaphore {index}")))
    }

    pub(crate) fn set_semaphore(&mut self, index: usize, value: u32) -> Result<()> {
        let slot = self
            .semaphores
            .get_mut(index)
            .ok_or_else(|| Error::Device(format!("unknown semaphore {index}")))?;
        *slot = value;
        Ok(())
    }

    /// Drop every buffer and semaphore.
    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
        self.semaphores.clear();
        self.dram_used = 0;
        self.l1_used = 0;
    }
}

fn class_mismatch(expected: &str, got: &DeviceData) -> Error {
    Error::DtypeMismatch {
        expected: expected.into(),
        got: got.class().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_accounting() {
        let mut mem = DeviceMemory::new(2, 1000, 100);
        let id = mem.allocate("kv", Region::Dram, 400, DType::BF16, 8).unwrap();
        assert_eq!(mem.usage().dram_used, 400);
        assert_eq!(mem.f32(id, 1).unwrap().len(), 8);
        assert!(mem.free(id));
        assert!(!mem.free(id));
        assert_eq!(mem.usage().dram_used, 0);
    }

    #[test]
    fn test_out_of_memory_reports_sizes() {
        let mut mem = DeviceMemory::new(1, 1000, 100);
        mem.allocate("a", Region::L1, 60, DType::F32, 4).unwrap();
        let err = mem.allocate("b", Region::L1, 60, DType::F32, 4).unwrap_err();
        match err {
            Error::OutOfMemory {
                what,
                requested,
                available,
            } => {
                assert!(what.contains("L1"));
                assert_eq!(requested, 60);
                assert_eq!(available, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_freed_buffer_reads_fail() {
        let mut mem = DeviceMemory::new(1, 1000, 100);
        let id = mem.allocate("x", Region::Dram, 16, DType::I32, 4).unwrap();
        mem.free(id);
        assert!(mem.i32(id, 0).is_err());
    }

    #[test]
    fn test_store_checks_length() {
        let mut mem = DeviceMemory::new(1, 1000, 100);
        let id = mem.allocate("x", Region::Dram, 16, DType::U32, 4).unwrap();
        assert!(mem.store(id, 0, DeviceData::U32(vec![1, 2])).is_err());
        mem.store(id, 0, DeviceData::U32(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(mem.u32(id, 0).unwrap(), &[1, 2, 3, 4]);
    }
}
