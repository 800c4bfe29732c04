//! Trace files: record model, binary codec, writers and readers
//!
//! # Format
//!
//! A trace is a sequence of frames, `varint(len) || payload`, with no header,
//! footer or magic number. It is self-delimiting: reading frames one after
//! another either ends exactly on a frame boundary (a complete trace) or
//! fails inside a frame (a damaged trace, usually the capture process died
//! mid-append). See [`codec`] for the payload layout.
//!
//! # Example
//!
//! ```rust,no_run
//! use iotrace_core::trace::{Operation, Record, TraceReader, TraceWriter};
//!
//! # fn main() -> iotrace_core::error::Result<()> {
//! let writer = TraceWriter::create("trace.log")?;
//! writer.append(Record::new(1, Operation::OpenRet { file: 3 }))?;
//! writer.close()?;
//!
//! let mut reader = TraceReader::open("trace.log")?;
//! while let Some(record) = reader.next_record()? {
//!     println!("{} {}", record.epoch_nanos, record.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod naming;
mod reader;
mod record;
mod source;
mod split;
mod summary;
mod writer;

pub use naming::{TraceLocation, discover_traces, process_trace_path};
pub use reader::TraceReader;
pub use record::{MAX_DAY, OpKind, Operation, Record, Stamp};
pub use source::{RecordSource, VecSource};
pub use split::{SplitReader, SplitWriter};
pub use summary::TraceSummary;
pub use writer::{TraceClock, TraceWriter, WriterOptions};

#[cfg(test)]
mod tests;
