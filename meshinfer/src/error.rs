//! Error types for meshinfer

use thiserror::Error;

/// Result type alias using meshinfer's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshinfer operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Out of device memory allocating {what}: requested {requested} bytes, {available} bytes available")]
    OutOfMemory {
        what: String,
        requested: usize,
        available: usize,
    },

    #[error("Trace {trace} invalidated: {reason}")]
    TraceInvalidated { trace: u32, reason: String },

    #[error("Program {0} is not in the program cache; run it eagerly before trace capture")]
    ProgramNotCompiled(String),

    #[error("Command queues stalled: {0}")]
    QueueStalled(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Layout mismatch: expected {expected}, got {got}")]
    LayoutMismatch { expected: String, got: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse error classes callers branch on at component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad user-supplied configuration. Not recoverable.
    Config,
    /// Filesystem, weight file, or tokenizer file problems.
    Io,
    /// Device memory exhausted (DRAM, L1, or trace region).
    OutOfMemory,
    /// A captured trace can no longer be replayed and must be rebuilt.
    TraceInvalidated,
    /// Everything else: programming errors surfaced as values.
    Internal,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_)
            | Self::Json(_)
            | Self::SafeTensors(_)
            | Self::WeightNotFound(_)
            | Self::Tokenizer(_) => ErrorKind::Io,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::TraceInvalidated { .. } => ErrorKind::TraceInvalidated,
            _ => ErrorKind::Internal,
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::config("batch 64").kind(), ErrorKind::Config);
        assert_eq!(
            Error::OutOfMemory {
                what: "kv".into(),
                requested: 10,
                available: 1
            }
            .kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(
            Error::TraceInvalidated {
                trace: 0,
                reason: "freed".into()
            }
            .kind(),
            ErrorKind::TraceInvalidated
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(Error::from(io).kind(), ErrorKind::Io);
        assert_eq!(Error::Other("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_oom_message_reports_sizes() {
        let e = Error::OutOfMemory {
            what: "trace region".into(),
            requested: 4096,
            available: 1024,
        };
        let msg = e.to_string();
        assert!(msg.contains("trace region"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }
}
