//! Close barrier across lanes
//!
//! READs and the CLOSE of one file may run on different lanes. The dispatcher
//! tags every READ it sends with a [`PendingRead`] for that file and hands the
//! file's [`ReadTracker`] to the CLOSE, whose lane waits until every tagged
//! READ has finished or been skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct ReadTracker {
    pending: AtomicUsize,
    drained: Notify,
}

impl ReadTracker {
    /// Count one more dispatched read
    pub(crate) fn track(self: &Arc<Self>) -> PendingRead {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingRead {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until no tracked read is outstanding
    pub(crate) async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Released when the read it was issued for is done
#[derive(Debug)]
pub(crate) struct PendingRead {
    tracker: Arc<ReadTracker>,
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if self.tracker.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
