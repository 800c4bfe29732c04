//! Backend that performs no I/O
//!
//! Every call succeeds and reads report the full requested length. Replaying
//! against it measures the dispatcher and lanes alone.

use super::{BackendConnector, BackendError, BackendHandle, FsBackend, clamp_len};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NullBackend {
    next_handle: AtomicU64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FsBackend for NullBackend {
    async fn open(
        &self,
        _path: &str,
        _flags: i64,
        _buffer_size: i64,
        _replication: i64,
        _block_size: i64,
    ) -> Result<BackendHandle, BackendError> {
        Ok(BackendHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    async fn read(
        &self,
        _handle: BackendHandle,
        _offset: i64,
        length: i64,
    ) -> Result<usize, BackendError> {
        Ok(clamp_len(length))
    }

    async fn close(&self, _handle: BackendHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn name(&self) -> &str {
        "null"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullConnector;

#[async_trait]
impl BackendConnector for NullConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Arc<dyn FsBackend>, BackendError> {
        Ok(Arc::new(NullBackend::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_report_requested_length() {
        let backend = NullConnector.connect("h", 0).await.unwrap();
        let a = backend.open("/x", 0, 0, 0, 0).await.unwrap();
        let b = backend.open("/x", 0, 0, 0, 0).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.read(a, 0, 4096).await.unwrap(), 4096);
        assert_eq!(backend.read(a, 0, -1).await.unwrap(), 0);
        backend.close(a).await.unwrap();
    }
}
