//! K-way chronological merge of trace streams
//!
//! Every capturing process writes its own trace, ordered by its own clock.
//! [`TraceMerger`] keeps one lookahead record per source in a min-heap keyed
//! by `(epoch_nanos, source index)` and repeatedly emits the smallest, so the
//! output is globally ordered and ties resolve by source order.
//!
//! The merger is itself a [`RecordSource`]: it can feed a [`TraceWriter`] or
//! go straight into the replay scheduler.

use crate::error::{IoTraceError, Result};
use crate::trace::{Record, RecordSource, TraceWriter, discover_traces};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct Lookahead {
    epoch_nanos: i64,
    source: usize,
    record: Record,
}

impl PartialEq for Lookahead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Lookahead {}

impl PartialOrd for Lookahead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lookahead {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.epoch_nanos, self.source).cmp(&(other.epoch_nanos, other.source))
    }
}

struct Slot<S> {
    source: Option<S>,
    yielded: u64,
}

/// Merges independently ordered record sources into one ordered stream
pub struct TraceMerger<S> {
    slots: Vec<Slot<S>>,
    heap: BinaryHeap<Reverse<Lookahead>>,
    primed: bool,
    pending_error: Option<IoTraceError>,
    failure: Option<(u64, String)>,
    emitted: u64,
}

impl<S: RecordSource> TraceMerger<S> {
    /// Merge `sources`; their order is the tie-break order
    pub fn new(sources: impl IntoIterator<Item = S>) -> Self {
        let slots: Vec<_> = sources
            .into_iter()
            .map(|source| Slot {
                source: Some(source),
                yielded: 0,
            })
            .collect();
        Self {
            heap: BinaryHeap::with_capacity(slots.len()),
            slots,
            primed: false,
            pending_error: None,
            failure: None,
            emitted: 0,
        }
    }

    /// Number of input sources
    pub fn source_count(&self) -> usize {
        self.slots.len()
    }

    /// Records emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Drain the merge into `writer`, preserving captured timestamps
    pub fn merge_into(&mut self, writer: &TraceWriter) -> Result<u64> {
        let mut written = 0;
        while let Some(record) = self.next_record()? {
            writer.append_verbatim(&record)?;
            written += 1;
        }
        Ok(written)
    }

    /// Next record in global order
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some((record, reason)) = &self.failure {
            return Err(IoTraceError::Truncated {
                record: *record,
                reason: reason.clone(),
            });
        }
        if let Some(err) = self.pending_error.take() {
            return Err(self.fail(err));
        }

        if !self.primed {
            self.primed = true;
            for index in 0..self.slots.len() {
                if let Err(err) = self.refill(index) {
                    return Err(self.fail(err));
                }
            }
        }

        let Some(Reverse(next)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Err(err) = self.refill(next.source) {
            self.pending_error = Some(err);
        }
        self.emitted += 1;
        Ok(Some(next.record))
    }

    fn refill(&mut self, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        let Some(source) = slot.source.as_mut() else {
            return Ok(());
        };

        match source.next_record() {
            Ok(Some(record)) => {
                slot.yielded += 1;
                self.heap.push(Reverse(Lookahead {
                    epoch_nanos: record.epoch_nanos,
                    source: index,
                    record,
                }));
                Ok(())
            }
            Ok(None) => {
                slot.source = None;
                Ok(())
            }
            Err(err) => {
                slot.source = None;
                Err(IoTraceError::Truncated {
                    record: slot.yielded + 1,
                    reason: format!("source #{index}: {err}"),
                })
            }
        }
    }

    fn fail(&mut self, err: IoTraceError) -> IoTraceError {
        if let IoTraceError::Truncated { record, reason } = &err {
            self.failure = Some((*record, reason.clone()));
        } else {
            self.failure = Some((self.emitted + 1, err.to_string()));
        }
        err
    }
}

impl<S: RecordSource> RecordSource for TraceMerger<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        TraceMerger::next_record(self)
    }
}

/// Outcome of [`merge_directory`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    /// Traces that were merged, in tie-break order
    pub sources: Vec<String>,

    /// Records written
    pub records: u64,

    /// Merged trace
    pub output: PathBuf,
}

/// Open every trace in `dir` and merge them into a new trace at `output`
pub fn merge_directory(dir: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<MergeReport> {
    let output = output.as_ref();
    let merger = open_directory(dir, Some(output))?;
    let sources = merger.1;
    let mut merger = merger.0;

    tracing::info!(
        sources = sources.len(),
        output = %output.display(),
        "Merging trace files"
    );

    let writer = TraceWriter::create(output)?;
    let records = merger.merge_into(&writer)?;
    writer.close()?;

    tracing::info!(records, output = %output.display(), "Finished merging trace files");

    Ok(MergeReport {
        sources,
        records,
        output: output.to_path_buf(),
    })
}

/// Build a merger over every trace in `dir`, returning it with the source names
pub fn open_directory(
    dir: impl AsRef<Path>,
    exclude: Option<&Path>,
) -> Result<(TraceMerger<Box<dyn RecordSource>>, Vec<String>)> {
    let locations = discover_traces(dir, exclude)?;
    let mut names = Vec::with_capacity(locations.len());
    let mut sources = Vec::with_capacity(locations.len());
    for location in &locations {
        sources.push(location.open()?);
        names.push(location.to_string());
    }
    Ok((TraceMerger::new(sources), names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Operation, Stamp, TraceReader, VecSource};

    fn at(nanos: i64, thread_id: i64) -> Record {
        Record::new(thread_id, Operation::ReadRet { code: nanos }).with_stamp(Stamp {
            epoch_nanos: nanos,
            day: 0,
            time: nanos as u64,
        })
    }

    fn drain<S: RecordSource>(merger: &mut TraceMerger<S>) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = merger.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_three_single_record_streams() {
        let mut merger = TraceMerger::new(vec![
            VecSource::new(vec![at(10, 1)]),
            VecSource::new(vec![at(5, 2)]),
            VecSource::new(vec![at(7, 3)]),
        ]);
        let times: Vec<_> = drain(&mut merger).iter().map(|r| r.epoch_nanos).collect();
        assert_eq!(times, vec![5, 7, 10]);
    }

    #[test]
    fn test_output_is_sorted_permutation() {
        let streams = vec![
            vec![at(1, 1), at(4, 1), at(9, 1), at(12, 1)],
            vec![],
            vec![at(2, 2), at(3, 2), at(10, 2)],
            vec![at(4, 3), at(5, 3), at(6, 3), at(7, 3), at(8, 3)],
        ];
        let total: usize = streams.iter().map(Vec::len).sum();

        let mut merger = TraceMerger::new(streams.into_iter().map(VecSource::new));
        let merged = drain(&mut merger);

        assert_eq!(merged.len(), total);
        assert!(merged.windows(2).all(|w| w[0].epoch_nanos <= w[1].epoch_nanos));
        // tie at 4: source 0 before source 3
        let fours: Vec<_> = merged
            .iter()
            .filter(|r| r.epoch_nanos == 4)
            .map(|r| r.thread_id)
            .collect();
        assert_eq!(fours, vec![1, 3]);
    }

    #[test]
    fn test_year_rollover_orders_by_epoch() {
        // day 364 of one year, then day 0 of the next
        let late = Record::new(1, Operation::CloseRet { code: 0 }).with_stamp(Stamp {
            epoch_nanos: 1_000,
            day: 364,
            time: 86_399_000_000_000,
        });
        let early_next_year = Record::new(2, Operation::CloseRet { code: 0 }).with_stamp(Stamp {
            epoch_nanos: 2_000,
            day: 0,
            time: 1,
        });

        let mut merger = TraceMerger::new(vec![
            VecSource::new(vec![early_next_year.clone()]),
            VecSource::new(vec![late.clone()]),
        ]);
        assert_eq!(drain(&mut merger), vec![late, early_next_year]);
    }

    #[test]
    fn test_source_error_aborts_merge() {
        let mut damaged = crate::trace::codec::encode(&at(3, 9));
        damaged.push(0x10);
        let readers: Vec<Box<dyn RecordSource>> = vec![
            Box::new(VecSource::new(vec![at(1, 1), at(2, 1), at(5, 1)])),
            Box::new(TraceReader::new(std::io::Cursor::new(damaged))),
        ];
        let mut merger = TraceMerger::new(readers);

        let mut seen = Vec::new();
        let err = loop {
            match merger.next_record() {
                Ok(Some(record)) => seen.push(record.epoch_nanos),
                Ok(None) => panic!("merge should not end cleanly"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, IoTraceError::Truncated { record: 2, .. }));
        assert!(merger.next_record().is_err());
        assert!(seen.len() <= 3);
    }

    #[test]
    fn test_merge_directory_writes_ordered_trace() {
        let dir = tempfile::TempDir::new().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();

        let a = TraceWriter::create(dir.path().join("trace_1.log")).unwrap();
        let b = TraceWriter::create(dir.path().join("trace_2.log")).unwrap();
        for (writer, times) in [(&a, [3, 6, 9]), (&b, [1, 6, 8])] {
            for t in times {
                writer.append_verbatim(&at(t, t)).unwrap();
            }
            writer.close().unwrap();
        }

        let output = out_dir.path().join("merged.log");
        let report = merge_directory(dir.path(), &output).unwrap();
        assert_eq!(report.records, 6);
        assert_eq!(report.sources.len(), 2);

        let times: Vec<_> = TraceReader::open(&output)
            .unwrap()
            .map(|r| r.unwrap().epoch_nanos)
            .collect();
        assert_eq!(times, vec![1, 3, 6, 6, 8, 9]);
    }

    #[test]
    fn test_open_directory_skips_earlier_merge_output() {
        let dir = tempfile::TempDir::new().unwrap();
        for (name, times) in [("trace_1.log", [2, 4]), ("trace_2.log", [1, 3])] {
            let writer = TraceWriter::create(dir.path().join(name)).unwrap();
            for t in times {
                writer.append_verbatim(&at(t, t)).unwrap();
            }
            writer.close().unwrap();
        }
        // A merge that wrote into the traced directory itself
        merge_directory(dir.path(), dir.path().join("merged.log")).unwrap();

        let elsewhere = tempfile::TempDir::new().unwrap();
        let exclude = elsewhere.path().join("merged.log");
        let (mut merger, names) = open_directory(dir.path(), Some(&exclude)).unwrap();
        assert_eq!(names.len(), 2);
        let times: Vec<_> = drain(&mut merger).iter().map(|r| r.epoch_nanos).collect();
        assert_eq!(times, vec![1, 2, 3, 4]);
    }
}
