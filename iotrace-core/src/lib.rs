//! # iotrace - Capture, merge and replay filesystem-client traces
//!
//! iotrace records the open/read/close calls a fleet of filesystem clients
//! makes, stores them as compact binary traces, and replays them later
//! against a backend to reproduce the load or measure throughput:
//! - Append-only varint-framed trace files, safe to write from many threads
//! - Readers that tell a clean end of trace from a damaged one
//! - Chronological k-way merge of per-process traces
//! - Concurrent replay with one ordered lane per captured thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iotrace_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Merge every per-process trace in a directory into one
//!     let report = merge_directory("./traces", "./merged/trace.log")?;
//!     println!("merged {} records", report.records);
//!
//!     // Replay the merged trace without touching any files
//!     let replayer = Replayer::new(Arc::new(NullBackend::new()), ReplayConfig::default());
//!     let report = replayer.replay(TraceReader::open("./merged/trace.log")?).await?;
//!     println!("{:.0} file ops/s", report.throughput());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **trace**: record model, codec, writers, readers, discovery, summaries
//! - **merge**: k-way merge keyed by capture timestamp
//! - **replay**: dispatcher, lanes and the shared handle table
//! - **backend**: the filesystem contract replay drives, plus local and null backends

pub mod backend;
pub mod config;
pub mod error;
pub mod merge;
pub mod replay;
pub mod trace;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{
        BackendConnector, BackendError, BackendHandle, FsBackend, LocalConnector, LocalFsBackend,
        NullBackend, NullConnector,
    };
    pub use crate::config::{BackendConfig, IoTraceConfig, PathRewrite, ReplayConfig};
    pub use crate::error::{IoTraceError, Result};
    pub use crate::merge::{MergeReport, TraceMerger, merge_directory};
    pub use crate::replay::{ReplayOutcome, ReplayReport, Replayer, StatsSnapshot};
    pub use crate::trace::{
        OpKind, Operation, Record, RecordSource, SplitReader, SplitWriter, Stamp, TraceLocation,
        TraceReader, TraceSummary, TraceWriter, VecSource, discover_traces,
    };
}
