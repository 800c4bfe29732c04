//! Worker lanes
//!
//! A lane is a tokio task that executes the records of one capture-time
//! thread in the order they were dispatched. Lanes never remove themselves:
//! the dispatcher owns them and retires the idle ones.

use super::barrier::{PendingRead, ReadTracker};
use super::handles::HandleTable;
use super::stats::ReplayStats;
use crate::backend::{BackendHandle, FsBackend};
use crate::config::PathRewrite;
use crate::error::IoTraceError;
use crate::trace::{Operation, Record};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where a lane is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// Queue empty, waiting for work
    Idle,
    /// Executing or holding queued jobs
    Draining,
    /// Removed from the registry; receives nothing more
    Retired,
}

/// One record plus the barrier bookkeeping the dispatcher attached to it
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) record: Record,
    /// Set on READs; released once the read is done or skipped
    pub(crate) pending_read: Option<PendingRead>,
    /// Set on CLOSEs; reads of the file dispatched before the close
    pub(crate) read_barrier: Option<Arc<ReadTracker>>,
}

impl Job {
    pub(crate) fn new(record: Record) -> Self {
        Self {
            record,
            pending_read: None,
            read_barrier: None,
        }
    }
}

/// Everything lanes share
pub(crate) struct LaneContext {
    pub(crate) backend: Arc<dyn FsBackend>,
    pub(crate) handles: HandleTable,
    pub(crate) stats: Arc<ReplayStats>,
    pub(crate) rewrite: Option<PathRewrite>,
    pub(crate) verify_reads: bool,
}

#[derive(Debug)]
struct Activity {
    queued: AtomicUsize,
    last_active: Mutex<Instant>,
    retired: AtomicBool,
}

impl Activity {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Dispatcher-side handle of a running lane
pub(crate) struct Lane {
    key: i64,
    sender: mpsc::UnboundedSender<Job>,
    activity: Arc<Activity>,
    task: JoinHandle<()>,
}

impl Lane {
    /// Start a lane task
    pub(crate) fn spawn(key: i64, context: Arc<LaneContext>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let activity = Arc::new(Activity {
            queued: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            retired: AtomicBool::new(false),
        });
        let task = tokio::spawn(run(receiver, Arc::clone(&activity), context));
        tracing::debug!(lane = key, "Spawned replay lane");
        Self {
            key,
            sender,
            activity,
            task,
        }
    }

    pub(crate) fn key(&self) -> i64 {
        self.key
    }

    pub(crate) fn state(&self) -> LaneState {
        if self.activity.retired.load(Ordering::Acquire) {
            LaneState::Retired
        } else if self.activity.queued.load(Ordering::Acquire) > 0 {
            LaneState::Draining
        } else {
            LaneState::Idle
        }
    }

    /// Whether the lane has had nothing to do for at least `timeout`
    pub(crate) fn is_idle_for(&self, timeout: Duration) -> bool {
        self.state() == LaneState::Idle && self.activity.idle_for() >= timeout
    }

    /// Queue a job; hands it back if the lane task is gone
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        debug_assert_ne!(self.state(), LaneState::Retired);
        self.activity.queued.fetch_add(1, Ordering::AcqRel);
        self.activity.touch();
        self.sender.send(job).map_err(|err| {
            self.activity.queued.fetch_sub(1, Ordering::AcqRel);
            err.0
        })
    }

    /// Close the queue; the task exits once it has drained
    pub(crate) fn retire(self) -> JoinHandle<()> {
        self.activity.retired.store(true, Ordering::Release);
        tracing::debug!(lane = self.key, "Retired replay lane");
        self.task
    }
}

async fn run(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    activity: Arc<Activity>,
    context: Arc<LaneContext>,
) {
    let mut worker = Worker {
        context,
        last_read: HashMap::new(),
    };
    while let Some(job) = receiver.recv().await {
        worker.execute(job).await;
        activity.touch();
        activity.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    context: Arc<LaneContext>,
    /// Result of the last backend read per capture-time thread, for verify mode
    last_read: HashMap<i64, i64>,
}

impl Worker {
    async fn execute(&mut self, job: Job) {
        let Job {
            record,
            pending_read,
            read_barrier,
        } = job;
        let thread_id = record.thread_id;

        match record.operation {
            Operation::Open {
                path,
                flags,
                buffer_size,
                replication,
                block_size,
                ..
            } => {
                self.open(thread_id, &path, flags, buffer_size, replication, block_size)
                    .await
            }
            Operation::OpenRet { file } => self.open_ret(thread_id, file).await,
            Operation::Read {
                file,
                offset,
                length,
                ..
            } => {
                self.read(thread_id, file, offset, length).await;
                drop(pending_read);
            }
            Operation::ReadRet { code } => self.verify(thread_id, code),
            Operation::Close { file, .. } => {
                if let Some(barrier) = read_barrier {
                    barrier.wait().await;
                }
                self.close(thread_id, file).await;
            }
            Operation::CloseRet { .. } => {}
        }
    }

    async fn open(
        &mut self,
        thread_id: i64,
        path: &str,
        flags: i64,
        buffer_size: i64,
        replication: i64,
        block_size: i64,
    ) {
        let ctx = &self.context;
        let path = match &ctx.rewrite {
            Some(rewrite) => rewrite.apply(path),
            None => path.into(),
        };

        match ctx
            .backend
            .open(&path, flags, buffer_size, replication, block_size)
            .await
        {
            Ok(handle) => {
                ctx.stats.record_open();
                if let Some(stale) = ctx.handles.insert_opening(thread_id, handle) {
                    tracing::warn!(thread = thread_id, path = %path, "OPEN without OPEN_RET, closing earlier handle");
                    self.release(stale).await;
                }
            }
            Err(e) => {
                ctx.stats.record_backend_error();
                tracing::warn!(thread = thread_id, path = %path, error = %e, "Backend open failed");
            }
        }
    }

    async fn open_ret(&mut self, thread_id: i64, file: i64) {
        match self.context.handles.promote(thread_id, file) {
            Ok(None) => {}
            Ok(Some(displaced)) => {
                tracing::warn!(thread = thread_id, file, "File id reused while still open, closing earlier handle");
                if let Some(handle) = displaced.drained().await {
                    self.release(handle).await;
                }
            }
            Err(e) => self.missing(thread_id, "OPEN_RET", e),
        }
    }

    async fn read(&mut self, thread_id: i64, file: i64, offset: i64, length: i64) {
        let ctx = &self.context;
        let lease = match ctx.handles.acquire(file) {
            Ok(lease) => lease,
            Err(e) => {
                self.last_read.remove(&thread_id);
                self.missing(thread_id, "READ", e);
                return;
            }
        };

        let result = ctx.backend.read(lease.handle(), offset, length).await;
        drop(lease);

        let code = match result {
            Ok(bytes) => {
                ctx.stats.record_read(bytes);
                i64::try_from(bytes).unwrap_or(i64::MAX)
            }
            Err(e) => {
                ctx.stats.record_backend_error();
                tracing::warn!(thread = thread_id, file, offset, length, error = %e, "Backend read failed");
                -1
            }
        };
        self.last_read.insert(thread_id, code);
    }

    fn verify(&mut self, thread_id: i64, captured: i64) {
        let Some(replayed) = self.last_read.remove(&thread_id) else {
            return;
        };
        if self.context.verify_reads && replayed != captured {
            self.context.stats.record_verify_mismatch();
            tracing::debug!(thread = thread_id, captured, replayed, "Read size differs from capture");
        }
    }

    async fn close(&mut self, thread_id: i64, file: i64) {
        let ctx = &self.context;
        match ctx.handles.close(file).await {
            Ok(handle) => match ctx.backend.close(handle).await {
                Ok(()) => ctx.stats.record_close(),
                Err(e) => {
                    ctx.stats.record_backend_error();
                    tracing::warn!(thread = thread_id, file, error = %e, "Backend close failed");
                }
            },
            Err(e) => self.missing(thread_id, "CLOSE", e),
        }
    }

    async fn release(&self, handle: BackendHandle) {
        if let Err(e) = self.context.backend.close(handle).await {
            self.context.stats.record_backend_error();
            tracing::warn!(handle = %handle, error = %e, "Backend close failed");
        }
    }

    fn missing(&self, thread_id: i64, op: &str, err: IoTraceError) {
        self.context.stats.record_missing_handle();
        tracing::warn!(thread = thread_id, op, error = %err, "Skipping operation");
    }
}
