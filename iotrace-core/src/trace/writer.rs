//! Append-only trace writer
//!
//! One [`TraceWriter`] owns one trace file. Appends from any number of
//! threads are serialized by an internal mutex that covers the whole
//! "stamp, encode, write, flush" sequence, so frames never interleave and
//! timestamps follow append order.

use super::codec;
use super::record::{Record, Stamp};
use crate::error::{IoTraceError, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Monotonic stamping on top of the wall clock
///
/// The wall clock may step backwards (NTP, manual changes); a writer must
/// still emit non-decreasing timestamps, so a sample behind the previous one
/// is replaced by the previous stamp. Local time of day can also fall back
/// while the epoch keeps moving (daylight saving); within one day the
/// previous `(day, time)` is kept until local time catches up.
#[derive(Debug, Default)]
pub struct TraceClock {
    last: Option<Stamp>,
}

impl TraceClock {
    /// Stamp a freshly sampled instant
    pub fn stamp(&mut self, sampled: Stamp) -> Stamp {
        let stamp = match self.last {
            Some(last) if sampled.epoch_nanos < last.epoch_nanos => last,
            Some(last) if sampled.day == last.day && sampled.time < last.time => Stamp {
                time: last.time,
                ..sampled
            },
            _ => sampled,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Options for opening a trace writer
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Call `sync_data` after every append, not only on close
    pub sync_each_append: bool,
}

struct WriterState {
    file: File,
    clock: TraceClock,
    records: u64,
    closed: bool,
}

/// Writer for the canonical framed trace format
pub struct TraceWriter {
    path: PathBuf,
    options: WriterOptions,
    state: Mutex<WriterState>,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl TraceWriter {
    /// Create (or truncate) a trace file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_options(path, WriterOptions::default())
    }

    /// Create (or truncate) a trace file with explicit options
    pub fn create_with_options(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            options,
            state: Mutex::new(WriterState {
                file,
                clock: TraceClock::default(),
                records: 0,
                closed: false,
            }),
        })
    }

    /// Create a per-process trace next to `base` (see
    /// [`process_trace_path`](super::process_trace_path))
    pub fn create_for_process(base: impl AsRef<Path>) -> Result<Self> {
        Self::create(super::process_trace_path(base, std::process::id()))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames appended so far
    pub fn records_written(&self) -> u64 {
        self.lock().map(|state| state.records).unwrap_or(0)
    }

    /// Stamp `record` with the current time and append it
    ///
    /// Any timestamp already on `record` is ignored. Returns the record as
    /// written.
    pub fn append(&self, record: Record) -> Result<Record> {
        let mut state = self.lock()?;
        let stamp = state.clock.stamp(Stamp::now());
        let record = record.with_stamp(stamp);
        self.write_frame(&mut state, &codec::encode(&record))?;
        Ok(record)
    }

    /// Append `record` exactly as given, timestamps included
    ///
    /// Used when rewriting existing traces (merge, format conversion).
    pub fn append_verbatim(&self, record: &Record) -> Result<()> {
        let frame = codec::encode(record);
        let mut state = self.lock()?;
        self.write_frame(&mut state, &frame)
    }

    /// Flush and sync the file; later appends fail
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.closed {
            state.closed = true;
            state.file.flush()?;
            state.file.sync_data()?;
        }
        Ok(())
    }

    fn write_frame(&self, state: &mut WriterState, frame: &[u8]) -> Result<()> {
        if state.closed {
            return Err(IoTraceError::Io(std::io::Error::other(format!(
                "trace writer for {} is closed",
                self.path.display()
            ))));
        }
        state.file.write_all(frame)?;
        state.file.flush()?;
        if self.options.sync_each_append {
            state.file.sync_data()?;
        }
        state.records += 1;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.state
            .lock()
            .map_err(|_| IoTraceError::Other("trace writer lock poisoned".to_string()))
    }
}
