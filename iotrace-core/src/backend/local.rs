//! Backend over the local filesystem
//!
//! Trace paths are resolved beneath a root directory, so a trace captured
//! against a remote cluster can be replayed against a local copy of its
//! data. Files are opened read-only; the captured flags, replication and
//! block size have no local meaning and are ignored.

use super::{BackendConnector, BackendError, BackendHandle, FsBackend, clamp_len};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Largest single read buffer, whatever length the trace asks for
const MAX_READ_LEN: usize = 16 * 1024 * 1024;

/// Local filesystem backend rooted at a directory
pub struct LocalFsBackend {
    root: PathBuf,
    files: Mutex<HashMap<u64, Arc<File>>>,
    next_handle: AtomicU64,
    disconnected: AtomicBool,
}

impl LocalFsBackend {
    /// Create a backend resolving paths beneath `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files currently open
    pub fn open_files(&self) -> usize {
        self.files.lock().map(|files| files.len()).unwrap_or(0)
    }

    /// Map a trace path beneath the root; `..` components are refused
    fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BackendError::Open {
                        path: path.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "path leaves the replay root",
                        ),
                    });
                }
            }
        }
        Ok(resolved)
    }

    fn file(&self, handle: BackendHandle) -> Result<Arc<File>, BackendError> {
        self.ensure_connected()?;
        let files = self.files.lock().map_err(|_| poisoned())?;
        files
            .get(&handle.0)
            .cloned()
            .ok_or(BackendError::UnknownHandle(handle))
    }

    fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.disconnected.load(Ordering::Acquire) {
            Err(BackendError::Disconnected)
        } else {
            Ok(())
        }
    }
}

fn poisoned() -> BackendError {
    BackendError::Io(std::io::Error::other("handle table lock poisoned"))
}

fn join_error(err: tokio::task::JoinError) -> BackendError {
    BackendError::Io(std::io::Error::other(err))
}

#[async_trait]
impl FsBackend for LocalFsBackend {
    async fn open(
        &self,
        path: &str,
        _flags: i64,
        _buffer_size: i64,
        _replication: i64,
        _block_size: i64,
    ) -> Result<BackendHandle, BackendError> {
        self.ensure_connected()?;
        let resolved = self.resolve(path)?;
        let file = tokio::task::spawn_blocking(move || File::open(resolved))
            .await
            .map_err(join_error)?
            .map_err(|source| BackendError::Open {
                path: path.to_string(),
                source,
            })?;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.files
            .lock()
            .map_err(|_| poisoned())?
            .insert(id, Arc::new(file));
        Ok(BackendHandle(id))
    }

    async fn read(
        &self,
        handle: BackendHandle,
        offset: i64,
        length: i64,
    ) -> Result<usize, BackendError> {
        let file = self.file(handle)?;
        let offset = offset.max(0) as u64;
        let length = clamp_len(length).min(MAX_READ_LEN);

        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; length];
            let mut filled = 0;
            while filled < length {
                match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(BackendError::Io(e)),
                }
            }
            Ok(filled)
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&self, handle: BackendHandle) -> Result<(), BackendError> {
        self.ensure_connected()?;
        let removed = self.files.lock().map_err(|_| poisoned())?.remove(&handle.0);
        removed.map(drop).ok_or(BackendError::UnknownHandle(handle))
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        if let Ok(mut files) = self.files.lock() {
            if !files.is_empty() {
                tracing::warn!(open = files.len(), "Disconnecting with files still open");
            }
            files.clear();
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Connects [`LocalFsBackend`]s; host and port are logged and otherwise ignored
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BackendConnector for LocalConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn FsBackend>, BackendError> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| BackendError::Connect {
                host: host.to_string(),
                port,
                reason: format!("root {}: {e}", self.root.display()),
            })?;
        if !metadata.is_dir() {
            return Err(BackendError::Connect {
                host: host.to_string(),
                port,
                reason: format!("root {} is not a directory", self.root.display()),
            });
        }

        tracing::debug!(host, port, root = %self.root.display(), "Connected local backend");
        Ok(Arc::new(LocalFsBackend::new(self.root.clone())))
    }
}
