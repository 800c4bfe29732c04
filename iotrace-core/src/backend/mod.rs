//! Filesystem backends driven by replay
//!
//! Replay never talks to a filesystem directly. It issues operations through
//! [`FsBackend`], obtained from a [`BackendConnector`] given the target host
//! and port. Paths, credentials and connection policy belong to the
//! connector, not to the replay engine.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub mod local;
pub mod null;

pub use local::{LocalConnector, LocalFsBackend};
pub use null::{NullBackend, NullConnector};

/// Opaque handle to a file opened through a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub u64);

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure reported by a backend call
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Could not reach the filesystem
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Open failed
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The handle is not open on this backend
    #[error("Unknown backend handle {0}")]
    UnknownHandle(BackendHandle),

    /// Any other I/O failure
    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend is disconnected
    #[error("Backend is disconnected")]
    Disconnected,
}

/// Filesystem client capability consumed by replay
///
/// Implementations must be safe to call from many lanes at once.
#[async_trait]
pub trait FsBackend: Send + Sync {
    /// Open `path` for reading
    async fn open(
        &self,
        path: &str,
        flags: i64,
        buffer_size: i64,
        replication: i64,
        block_size: i64,
    ) -> Result<BackendHandle, BackendError>;

    /// Positional read of up to `length` bytes at `offset`, returning the
    /// number of bytes read
    async fn read(
        &self,
        handle: BackendHandle,
        offset: i64,
        length: i64,
    ) -> Result<usize, BackendError>;

    /// Close a handle returned by [`open`](Self::open)
    async fn close(&self, handle: BackendHandle) -> Result<(), BackendError>;

    /// Release the connection; later calls may fail with
    /// [`BackendError::Disconnected`]
    async fn disconnect(&self);

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Builds a connected backend for a target host and port
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect to the filesystem at `host:port`
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn FsBackend>, BackendError>;
}

/// Clamp a captured length or offset to something a buffer can hold
pub(crate) fn clamp_len(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}
