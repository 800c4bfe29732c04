//! Trace replay against a filesystem backend
//!
//! Replay reproduces the load a trace describes. Records are fanned out to
//! one lane per capture-time thread, so each thread's OPEN, READs and CLOSE
//! run in their captured order while different threads run in parallel.
//!
//! # Architecture
//!
//! - A blocking task pulls records from the [`RecordSource`](crate::trace::RecordSource)
//!   into a bounded channel.
//! - The dispatcher routes each record to its lane, spawning lanes lazily and
//!   retiring those idle for longer than the configured timeout.
//! - Lanes share a handle table mapping captured file ids to backend handles.
//!   A CLOSE waits until no read holds its file and, with the close barrier
//!   on, until every READ of that file dispatched before it has finished.
//!
//! # Example
//!
//! ```rust,no_run
//! use iotrace_core::backend::NullBackend;
//! use iotrace_core::config::ReplayConfig;
//! use iotrace_core::replay::Replayer;
//! use iotrace_core::trace::TraceReader;
//! use std::sync::Arc;
//!
//! # async fn run() -> iotrace_core::error::Result<()> {
//! let replayer = Replayer::new(Arc::new(NullBackend::new()), ReplayConfig::default());
//! let report = replayer.replay(TraceReader::open("trace.log")?).await?;
//! println!("{:.0} ops/s", report.throughput());
//! # Ok(())
//! # }
//! ```

mod barrier;
mod handles;
mod lane;
mod scheduler;
mod stats;

pub use handles::BASELINE_REFS;
pub use lane::LaneState;
pub use scheduler::Replayer;
pub use stats::{ReplayOutcome, ReplayReport, ReplayStats, StatsSnapshot};
