//! Weight provider trait and the host tensor it hands out.

use crate::{Error, Result};

/// An f32 tensor on the host, ready for conversion and upload.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape (e.g., `[out_features, in_features]` for a linear weight).
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    /// # Errors
    /// Returns an error if `data.len()` does not match `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::InvalidShape(format!(
                "shape {shape:?} holds {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Transpose a 2-D `[rows, cols]` tensor to `[cols, rows]`.
    ///
    /// # Errors
    /// Returns an error if the tensor is not 2-D.
    pub fn transpose_2d(&self) -> Result<Self> {
        let [rows, cols] = self.shape[..] else {
            return Err(Error::InvalidShape(format!(
                "transpose_2d needs a 2-D tensor, got {:?}",
                self.shape
            )));
        };
        let mut data = vec![0.0_f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Ok(Self {
            shape: vec![cols, rows],
            data,
        })
    }
}

/// Name → tensor map over all model parameters.
///
/// Implementations must be idempotent: asking for the same name twice
/// returns identical data.
pub trait WeightProvider {
    /// Fetch one tensor, converted to f32.
    ///
    /// # Errors
    /// Returns `WeightNotFound` for unknown names, or an I/O error.
    fn tensor(&self, name: &str) -> Result<HostTensor>;

    /// Whether `name` exists.
    fn contains(&self, name: &str) -> bool;

    /// Stable identifier of the weight source, used as a cache namespace.
    fn source_id(&self) -> String;
}

impl<P: WeightProvider + ?Sized> WeightProvider for &P {
    fn tensor(&self, name: &str) -> Result<HostTensor> {
        (**self).tensor(name)
    }

    fn contains(&self, name: &str) -> bool {
        (**self).contains(name)
    }

    fn source_id(&self) -> String {
        (**self).source_id()
    }
}
