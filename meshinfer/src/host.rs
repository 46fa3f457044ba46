//! Host-side data exchanged with a device mesh.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dtype::DType;
use crate::{Error, Result};

/// Host values for a tensor upload or readback.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

impl HostData {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage class of these values (`F32`, `I32` or `U32`).
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::I32(_) => DType::I32,
            Self::U32(_) => DType::U32,
        }
    }

    /// # Errors
    /// Returns `DtypeMismatch` unless the data is `F32`.
    pub fn into_f32(self) -> Result<Vec<f32>> {
        match self {
            Self::F32(v) => Ok(v),
            other => Err(mismatch(DType::F32, other.dtype())),
        }
    }

    /// # Errors
    /// Returns `DtypeMismatch` unless the data is `I32`.
    pub fn into_i32(self) -> Result<Vec<i32>> {
        match self {
            Self::I32(v) => Ok(v),
            other => Err(mismatch(DType::I32, other.dtype())),
        }
    }

    /// # Errors
    /// Returns `DtypeMismatch` unless the data is `U32`.
    pub fn into_u32(self) -> Result<Vec<u32>> {
        match self {
            Self::U32(v) => Ok(v),
            other => Err(mismatch(DType::U32, other.dtype())),
        }
    }
}

fn mismatch(expected: DType, got: DType) -> Error {
    Error::DtypeMismatch {
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

/// Landing zone for a non-blocking device-to-host read.
///
/// The backend fills it when the read command executes on its queue. The
/// host must synchronize on an event recorded after the read before looking
/// at the contents.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer {
    inner: Rc<RefCell<Option<HostData>>>,
}

impl HostBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the backend when the read lands.
    pub fn fill(&self, data: HostData) {
        *self.inner.borrow_mut() = Some(data);
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.inner.borrow().is_some()
    }

    /// Take the landed data, leaving the buffer empty for the next read.
    ///
    /// # Errors
    /// Returns an error if no read has landed since the last take.
    pub fn take(&self) -> Result<HostData> {
        self.inner
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::Device("host buffer read before the device filled it".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_data_conversions() {
        assert_eq!(HostData::U32(vec![1, 2]).into_u32().unwrap(), vec![1, 2]);
        assert_eq!(HostData::I32(vec![-1]).dtype(), DType::I32);
        let err = HostData::F32(vec![0.5]).into_u32().unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_host_buffer_take_empties() {
        let buf = HostBuffer::new();
        assert!(!buf.is_filled());
        assert!(buf.take().is_err());

        let alias = buf.clone();
        alias.fill(HostData::U32(vec![7]));
        assert!(buf.is_filled());
        assert_eq!(buf.take().unwrap(), HostData::U32(vec![7]));
        assert!(!alias.is_filled());
    }
}
