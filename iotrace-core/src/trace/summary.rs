//! Trace statistics
//!
//! Counts and rates over a whole trace, as reported by `iotrace inspect`.

use super::record::{OpKind, Record, Stamp};
use super::source::RecordSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Aggregate view of one trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Records read before the trace ended
    pub records: u64,

    /// Record count per operation name
    pub per_operation: BTreeMap<String, u64>,

    /// Distinct capture-time thread ids
    pub threads: usize,

    /// Stamp of the first record
    pub first: Option<Stamp>,

    /// Stamp of the last record
    pub last: Option<Stamp>,

    /// 1-based ordinal of the record that could not be read, if the trace is damaged
    pub premature_end: Option<u64>,

    /// Why the trace ended early
    pub premature_reason: Option<String>,
}

impl TraceSummary {
    /// Drain `source` and summarize it
    ///
    /// Damage does not fail the summary; it is recorded in `premature_end`.
    pub fn collect<S: RecordSource + ?Sized>(source: &mut S) -> Self {
        Self::collect_with(source, |_, _| {})
    }

    /// Like [`collect`](Self::collect), also handing each record with its
    /// 1-based ordinal to `visit`
    pub fn collect_with<S, F>(source: &mut S, mut visit: F) -> Self
    where
        S: RecordSource + ?Sized,
        F: FnMut(u64, &Record),
    {
        let mut summary = TraceSummary::default();
        let mut threads = HashSet::new();

        loop {
            match source.next_record() {
                Ok(Some(record)) => {
                    summary.records += 1;
                    visit(summary.records, &record);
                    threads.insert(record.thread_id);
                    *summary
                        .per_operation
                        .entry(record.kind().name().to_string())
                        .or_default() += 1;
                    if summary.first.is_none() {
                        summary.first = Some(record.stamp());
                    }
                    summary.last = Some(record.stamp());
                }
                Ok(None) => break,
                Err(err) => {
                    summary.premature_end = Some(summary.records + 1);
                    summary.premature_reason = Some(err.to_string());
                    break;
                }
            }
        }

        summary.threads = threads.len();
        summary
    }

    /// Count for one operation kind
    pub fn count(&self, kind: OpKind) -> u64 {
        self.per_operation.get(kind.name()).copied().unwrap_or(0)
    }

    /// File operations issued by clients (OPEN, READ and CLOSE)
    pub fn file_operations(&self) -> u64 {
        self.count(OpKind::Open) + self.count(OpKind::Read) + self.count(OpKind::Close)
    }

    /// Time between the first and the last record
    pub fn elapsed(&self) -> Duration {
        match (self.first, self.last) {
            (Some(first), Some(last)) if last.epoch_nanos > first.epoch_nanos => {
                Duration::from_nanos((last.epoch_nanos - first.epoch_nanos) as u64)
            }
            _ => Duration::ZERO,
        }
    }

    /// File operations per millisecond over the trace's span
    pub fn throughput_per_ms(&self) -> Option<f64> {
        let millis = self.elapsed().as_secs_f64() * 1_000.0;
        (millis > 0.0).then(|| self.file_operations() as f64 / millis)
    }

    /// Whether the trace ended cleanly
    pub fn is_complete(&self) -> bool {
        self.premature_end.is_none()
    }
}
