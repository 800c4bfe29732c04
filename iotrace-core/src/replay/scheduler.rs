//! Replay dispatcher
//!
//! A blocking pump reads the record source into a bounded channel. The
//! dispatcher drains the channel, routes each record to the lane of its
//! capture-time thread (creating lanes on first sight) and retires lanes
//! that have stayed idle. Lanes execute against the backend concurrently.

use super::barrier::ReadTracker;
use super::handles::HandleTable;
use super::lane::{Job, Lane, LaneContext, LaneState};
use super::stats::{ReplayOutcome, ReplayReport, ReplayStats, spawn_reporter};
use crate::backend::FsBackend;
use crate::config::ReplayConfig;
use crate::error::Result;
use crate::trace::{Operation, Record, RecordSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Lane key used for every record in sequential mode
const SEQUENTIAL_LANE: i64 = 0;

/// Replays traces against a filesystem backend
pub struct Replayer {
    backend: Arc<dyn FsBackend>,
    config: ReplayConfig,
    shutdown: CancellationToken,
}

impl Replayer {
    /// Create a replayer; the configuration is validated when a replay starts
    pub fn new(backend: Arc<dyn FsBackend>, config: ReplayConfig) -> Self {
        Self {
            backend,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Token that stops dispatch when cancelled
    ///
    /// Records already queued on lanes still execute. Once cancelled, the
    /// token stays cancelled, so later replays on this replayer stop at once.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Replay every record of `source`
    ///
    /// Backend failures and unknown handles are counted, not returned. A
    /// source that fails mid-trace ends the replay with
    /// [`ReplayOutcome::Premature`]; only an invalid configuration is an
    /// error.
    pub async fn replay<S>(&self, source: S) -> Result<ReplayReport>
    where
        S: RecordSource + 'static,
    {
        self.config.validate()?;
        let started = Instant::now();
        let stats = Arc::new(ReplayStats::default());

        tracing::info!(
            backend = self.backend.name(),
            sequential = self.config.sequential,
            wait = self.config.wait,
            "Starting replay"
        );

        let (sender, mut input) = mpsc::channel(self.config.input_buffer);
        let pump = tokio::task::spawn_blocking({
            let shutdown = self.shutdown.clone();
            move || pump(source, sender, shutdown)
        });

        let reporter_stop = CancellationToken::new();
        let reporter = match self.config.report_interval {
            Some(period) if !self.config.sequential => Some(spawn_reporter(
                Arc::clone(&stats),
                period,
                reporter_stop.clone(),
            )),
            _ => None,
        };

        let context = Arc::new(LaneContext {
            backend: Arc::clone(&self.backend),
            handles: HandleTable::new(),
            stats: Arc::clone(&stats),
            rewrite: self.config.path_rewrite.clone(),
            verify_reads: self.config.verify_reads,
        });
        let mut dispatcher = Dispatcher::new(Arc::clone(&context), &self.config);

        let mut reap = tokio::time::interval(self.config.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pacer = Pacer::new(self.config.wait);
        let mut held: Option<(Record, Instant)> = None;

        let outcome = loop {
            let hold_until = held.as_ref().map(|(_, at)| *at);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break ReplayOutcome::Stopped,
                _ = reap.tick() => dispatcher.reap_idle(),
                _ = tokio::time::sleep_until(hold_until.unwrap_or_else(Instant::now)), if hold_until.is_some() => {
                    if let Some((record, _)) = held.take() {
                        dispatcher.dispatch(record);
                    }
                }
                next = input.recv(), if hold_until.is_none() => match next {
                    None => break ReplayOutcome::Completed,
                    Some(Err(err)) => {
                        let record = dispatcher.dispatched() + 1;
                        tracing::error!(record, error = %err, "Trace ended prematurely");
                        break ReplayOutcome::Premature {
                            record,
                            reason: err.to_string(),
                        };
                    }
                    Some(Ok(record)) => {
                        let delay = pacer.delay(&record);
                        if delay.is_zero() {
                            dispatcher.dispatch(record);
                        } else {
                            held = Some((record, Instant::now() + delay));
                        }
                    }
                },
            }
        };

        drop(input);
        dispatcher.finish().await;

        reporter_stop.cancel();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                tracing::warn!(error = %e, "Bandwidth reporter failed");
            }
        }
        if let Err(e) = pump.await {
            tracing::warn!(error = %e, "Trace reader task failed");
        }

        let leftover = context.handles.len();
        if leftover > 0 {
            tracing::debug!(handles = leftover, "Files left open at end of trace");
        }

        let report = ReplayReport {
            stats: stats.snapshot(),
            elapsed: started.elapsed(),
            outcome,
        };
        tracing::info!(
            records = report.stats.dispatched,
            file_ops = report.stats.file_operations(),
            backend_errors = report.stats.backend_errors,
            missing_handles = report.stats.missing_handles,
            elapsed = ?report.elapsed,
            ops_per_sec = report.throughput(),
            "Replay finished"
        );
        Ok(report)
    }
}

/// Feed `source` into the dispatcher channel until it ends, fails or the
/// dispatcher goes away
fn pump<S: RecordSource>(
    mut source: S,
    sender: mpsc::Sender<Result<Record>>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match source.next_record() {
            Ok(Some(record)) => {
                if sender.blocking_send(Ok(record)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = sender.blocking_send(Err(err));
                return;
            }
        }
    }
}

/// Reproduces captured gaps between records in wait mode
struct Pacer {
    enabled: bool,
    previous: Option<i64>,
}

impl Pacer {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            previous: None,
        }
    }

    fn delay(&mut self, record: &Record) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let gap = self
            .previous
            .map_or(0, |previous| record.epoch_nanos.saturating_sub(previous));
        self.previous = Some(record.epoch_nanos);
        Duration::from_nanos(gap.max(0) as u64)
    }
}

/// Owns the lane registry and the close barrier trackers
struct Dispatcher {
    context: Arc<LaneContext>,
    lanes: HashMap<i64, Lane>,
    retired: Vec<JoinHandle<()>>,
    reads: HashMap<i64, Arc<ReadTracker>>,
    sequential: bool,
    close_barrier: bool,
    idle_timeout: Duration,
    dispatched: u64,
}

impl Dispatcher {
    fn new(context: Arc<LaneContext>, config: &ReplayConfig) -> Self {
        Self {
            context,
            lanes: HashMap::new(),
            retired: Vec::new(),
            reads: HashMap::new(),
            sequential: config.sequential,
            close_barrier: config.close_barrier,
            idle_timeout: config.lane_idle_timeout,
            dispatched: 0,
        }
    }

    fn dispatched(&self) -> u64 {
        self.dispatched
    }

    fn dispatch(&mut self, record: Record) {
        let key = if self.sequential {
            SEQUENTIAL_LANE
        } else {
            record.thread_id
        };

        let mut job = Job::new(record);
        if self.close_barrier {
            match &job.record.operation {
                Operation::Read { file, .. } => {
                    job.pending_read = Some(self.reads.entry(*file).or_default().track());
                }
                Operation::Close { file, .. } => {
                    job.read_barrier = self.reads.remove(file);
                }
                _ => {}
            }
        }

        if let Err(job) = self.lane(key).submit(job) {
            // The lane task is gone (it panicked); replace it
            if let Some(dead) = self.lanes.remove(&key) {
                tracing::warn!(lane = dead.key(), "Replay lane stopped unexpectedly, restarting");
                self.retired.push(dead.retire());
            }
            if self.lane(key).submit(job).is_err() {
                tracing::error!(lane = key, "Replay lane rejected job, dropping record");
            }
        }

        self.dispatched += 1;
        self.context.stats.record_dispatched();
    }

    fn lane(&mut self, key: i64) -> &Lane {
        let context = &self.context;
        self.lanes.entry(key).or_insert_with(|| {
            context.stats.record_lane_spawned();
            Lane::spawn(key, Arc::clone(context))
        })
    }

    /// Retire lanes with an empty queue that have been idle long enough
    fn reap_idle(&mut self) {
        let idle: Vec<i64> = self
            .lanes
            .iter()
            .filter(|(_, lane)| lane.is_idle_for(self.idle_timeout))
            .map(|(key, _)| *key)
            .collect();

        for key in idle {
            if let Some(lane) = self.lanes.remove(&key) {
                self.retired.push(lane.retire());
                self.context.stats.record_lane_retired();
            }
        }

        self.retired.retain(|task| !task.is_finished());
        self.reads.retain(|_, tracker| tracker.pending() > 0);
    }

    /// Close every lane queue and wait for the queued work to finish
    async fn finish(self) {
        let mut tasks = self.retired;
        for (_, lane) in self.lanes {
            debug_assert_ne!(lane.state(), LaneState::Retired);
            tasks.push(lane.retire());
        }
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Replay lane failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Stamp;

    fn at(nanos: i64) -> Record {
        Record::new(1, Operation::CloseRet { code: 0 }).with_stamp(Stamp {
            epoch_nanos: nanos,
            day: 0,
            time: nanos as u64,
        })
    }

    #[test]
    fn test_pacer_gaps() {
        let mut pacer = Pacer::new(true);
        assert_eq!(pacer.delay(&at(1_000)), Duration::ZERO);
        assert_eq!(pacer.delay(&at(3_500)), Duration::from_nanos(2_500));
        assert_eq!(pacer.delay(&at(2_000)), Duration::ZERO);
        assert_eq!(pacer.delay(&at(2_000)), Duration::ZERO);

        let mut off = Pacer::new(false);
        off.delay(&at(0));
        assert_eq!(off.delay(&at(1_000_000_000)), Duration::ZERO);
    }
}
