//! Identifiers and geometry shared by every mesh backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shape of a 2-D grid of chips, `rows x cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshShape {
    pub rows: usize,
    pub cols: usize,
}

impl MeshShape {
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    #[must_use]
    pub const fn num_devices(&self) -> usize {
        self.rows * self.cols
    }

    /// `(row, col)` of a row-major device index.
    #[must_use]
    pub const fn coords(&self, device: usize) -> (usize, usize) {
        (device / self.cols, device % self.cols)
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// In-order device command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub usize);

impl QueueId {
    /// CQ0: compute and trace replay.
    pub const COMPUTE: Self = Self(0);
    /// CQ1: host-visible transfers.
    pub const TRANSFER: Self = Self(1);
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cq{}", self.0)
    }
}

/// Handle to a captured trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u32);

/// Index of a sub-device within the loaded sub-device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubDeviceId(pub usize);

/// Handle to a created (not necessarily loaded) sub-device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubDeviceManagerId(pub u32);

/// A worker core coordinate on one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreCoord {
    pub x: usize,
    pub y: usize,
}

impl CoreCoord {
    #[must_use]
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreRange {
    pub start: CoreCoord,
    pub end: CoreCoord,
}

impl CoreRange {
    #[must_use]
    pub const fn new(start: CoreCoord, end: CoreCoord) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn num_cores(&self) -> usize {
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    #[must_use]
    pub const fn contains(&self, core: CoreCoord) -> bool {
        core.x >= self.start.x
            && core.x <= self.end.x
            && core.y >= self.start.y
            && core.y <= self.end.y
    }

    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start.x <= other.end.x
            && other.start.x <= self.end.x
            && self.start.y <= other.end.y
            && other.start.y <= self.end.y
    }
}

/// Union of disjoint core rectangles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CoreRangeSet {
    pub ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    #[must_use]
    pub fn new(ranges: Vec<CoreRange>) -> Self {
        Self { ranges }
    }

    #[must_use]
    pub fn single(range: CoreRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.ranges.iter().map(CoreRange::num_cores).sum()
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.intersects(b)))
    }

    #[must_use]
    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }
}

/// A named subset of the cores on every chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDevice {
    pub cores: CoreRangeSet,
}

/// Link topology used by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    Linear,
    Ring,
}

/// Optional async plumbing for a collective: the semaphore it signals and
/// the sub-device its workers run on.
pub struct CollectiveParams<'a, S> {
    pub topology: Topology,
    pub semaphore: Option<&'a S>,
    pub sub_device: Option<SubDeviceId>,
}

impl<S> CollectiveParams<'_, S> {
    /// Synchronous collective with the given topology.
    #[must_use]
    pub const fn sync(topology: Topology) -> Self {
        Self {
            topology,
            semaphore: None,
            sub_device: None,
        }
    }
}

impl<S> Clone for CollectiveParams<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for CollectiveParams<'_, S> {}

/// Owned collective configuration a model applies to every collective it
/// issues. Sync by default; the orchestrator fills in the semaphore and the
/// CCL sub-device when the fabric is up.
#[derive(Debug, Clone)]
pub struct CollectiveSetup<S> {
    pub topology: Topology,
    pub semaphore: Option<S>,
    pub sub_device: Option<SubDeviceId>,
}

impl<S> CollectiveSetup<S> {
    #[must_use]
    pub const fn sync(topology: Topology) -> Self {
        Self {
            topology,
            semaphore: None,
            sub_device: None,
        }
    }

    /// Borrowed parameters for one collective call.
    #[must_use]
    pub fn params(&self) -> CollectiveParams<'_, S> {
        CollectiveParams {
            topology: self.topology,
            semaphore: self.semaphore.as_ref(),
            sub_device: self.sub_device,
        }
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.semaphore.is_some()
    }
}
