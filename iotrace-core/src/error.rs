//! Error types for iotrace operations

/// Result type for iotrace operations
pub type Result<T> = std::result::Result<T, IoTraceError>;

/// Error types for trace capture, merge and replay
#[derive(Debug, thiserror::Error)]
pub enum IoTraceError {
    /// A frame or payload could not be parsed
    #[error("Malformed record at byte {offset}: {reason}")]
    MalformedRecord {
        /// Byte offset of the frame within its stream
        offset: u64,
        /// What was wrong with it
        reason: String,
    },

    /// A trace ended before its last record was complete
    #[error("Trace ended prematurely at record #{record}: {reason}")]
    Truncated {
        /// 1-based ordinal of the record that could not be read
        record: u64,
        /// Underlying cause
        reason: String,
    },

    /// The filesystem backend failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Replay referenced a file handle with no live mapping
    #[error("File handle not found: {0}")]
    HandleNotFound(i64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error on the trace file itself
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl IoTraceError {
    /// Shorthand for a [`IoTraceError::MalformedRecord`]
    pub fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        IoTraceError::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether this error describes a damaged trace rather than an I/O failure
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IoTraceError::MalformedRecord { .. } | IoTraceError::Truncated { .. }
        )
    }
}

impl From<String> for IoTraceError {
    fn from(s: String) -> Self {
        IoTraceError::Other(s)
    }
}

impl From<&str> for IoTraceError {
    fn from(s: &str) -> Self {
        IoTraceError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for IoTraceError {
    fn from(err: anyhow::Error) -> Self {
        IoTraceError::Other(err.to_string())
    }
}

impl From<crate::backend::BackendError> for IoTraceError {
    fn from(err: crate::backend::BackendError) -> Self {
        IoTraceError::Backend(err.to_string())
    }
}
