//! Replay counters, the final report and the periodic bandwidth reporter

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live counters shared by the dispatcher and every lane
#[derive(Debug, Default)]
pub struct ReplayStats {
    dispatched: AtomicU64,
    opens: AtomicU64,
    reads: AtomicU64,
    closes: AtomicU64,
    bytes_read: AtomicU64,
    backend_errors: AtomicU64,
    missing_handles: AtomicU64,
    verify_mismatches: AtomicU64,
    lanes_spawned: AtomicU64,
    lanes_retired: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ReplayStats {
    counter! {
        record_dispatched => dispatched,
        record_open => opens,
        record_close => closes,
        record_backend_error => backend_errors,
        record_missing_handle => missing_handles,
        record_verify_mismatch => verify_mismatches,
        record_lane_spawned => lanes_spawned,
        record_lane_retired => lanes_retired,
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            missing_handles: self.missing_handles.load(Ordering::Relaxed),
            verify_mismatches: self.verify_mismatches.load(Ordering::Relaxed),
            lanes_spawned: self.lanes_spawned.load(Ordering::Relaxed),
            lanes_retired: self.lanes_retired.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Records handed to lanes
    pub dispatched: u64,
    /// Successful backend opens
    pub opens: u64,
    /// Successful backend reads
    pub reads: u64,
    /// Successful backend closes
    pub closes: u64,
    /// Bytes returned by backend reads
    pub bytes_read: u64,
    /// Failed backend calls
    pub backend_errors: u64,
    /// Operations skipped because their file handle was unknown
    pub missing_handles: u64,
    /// Reads whose size differed from the captured READ_RET
    pub verify_mismatches: u64,
    pub lanes_spawned: u64,
    pub lanes_retired: u64,
}

impl StatsSnapshot {
    /// Completed file operations (opens, reads and closes)
    pub fn file_operations(&self) -> u64 {
        self.opens + self.reads + self.closes
    }
}

/// How a replay ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// The whole trace was replayed
    Completed,
    /// Dispatch was stopped through the shutdown handle
    Stopped,
    /// The trace could not be read past record `record` (1-based)
    Premature { record: u64, reason: String },
}

/// Result of one replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub stats: StatsSnapshot,

    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,

    pub outcome: ReplayOutcome,
}

impl ReplayReport {
    /// File operations per second
    pub fn throughput(&self) -> f64 {
        per_second(self.stats.file_operations(), self.elapsed)
    }

    /// Bytes read per second
    pub fn bandwidth(&self) -> f64 {
        per_second(self.stats.bytes_read, self.elapsed)
    }

    /// Whether the trace was replayed to its clean end
    pub fn is_complete(&self) -> bool {
        self.outcome == ReplayOutcome::Completed
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Log read bandwidth every `period` until `stop` fires
pub(crate) fn spawn_reporter(
    stats: Arc<ReplayStats>,
    period: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        let mut last_bytes = stats.bytes_read();
        let mut last_at = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let now = tokio::time::Instant::now();
                    let bytes = stats.bytes_read();
                    let rate = per_second(bytes - last_bytes, now - last_at);
                    tracing::info!(
                        mib_per_sec = rate / (1024.0 * 1024.0),
                        bytes_read = bytes,
                        "Replay bandwidth"
                    );
                    last_bytes = bytes;
                    last_at = now;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_rates() {
        let stats = ReplayStats::default();
        stats.record_open();
        stats.record_read(1000);
        stats.record_read(3000);
        stats.record_close();
        stats.record_missing_handle();

        let report = ReplayReport {
            stats: stats.snapshot(),
            elapsed: Duration::from_secs(2),
            outcome: ReplayOutcome::Completed,
        };
        assert_eq!(report.stats.file_operations(), 4);
        assert_eq!(report.stats.missing_handles, 1);
        assert_eq!(report.throughput(), 2.0);
        assert_eq!(report.bandwidth(), 2000.0);
        assert!(report.is_complete());
    }

    #[test]
    fn test_report_serializes_outcome() {
        let report = ReplayReport {
            stats: StatsSnapshot::default(),
            elapsed: Duration::from_millis(1500),
            outcome: ReplayOutcome::Premature {
                record: 12,
                reason: "bad frame".to_string(),
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["status"], "premature");
        assert_eq!(json["outcome"]["record"], 12);
        assert_eq!(json["elapsed"], "1s 500ms");
        assert_eq!(report.throughput(), 0.0);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_cancel() {
        let stop = CancellationToken::new();
        let handle = spawn_reporter(
            Arc::new(ReplayStats::default()),
            Duration::from_millis(10),
            stop.clone(),
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
