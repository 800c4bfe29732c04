//! End-to-end tests: capture per-process traces, merge them, replay the result
//!
//! These tests drive the public API the way the CLI does, against real files
//! in temporary directories.

use iotrace_core::prelude::*;
use iotrace_core::trace::process_trace_path;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PROCESSES: i64 = 2;
const THREADS: i64 = 3;
const READS: i64 = 4;
const READ_LEN: i64 = 100;

fn data_path(process: i64, thread: i64) -> String {
    format!("/data/p{process}/t{thread}")
}

/// Write one file per simulated thread beneath `root`
fn populate(root: &Path) {
    for process in 1..=PROCESSES {
        std::fs::create_dir_all(root.join(format!("data/p{process}"))).unwrap();
        for thread in 1..=THREADS {
            std::fs::write(
                root.join(format!("data/p{process}/t{thread}")),
                vec![b'x'; 1000],
            )
            .unwrap();
        }
    }
}

/// Capture what `THREADS` client threads of one process would log
fn capture_process(base: &Path, process: i64) {
    let writer = Arc::new(TraceWriter::create(process_trace_path(base, process as u32)).unwrap());

    let threads: Vec<_> = (1..=THREADS)
        .map(|thread| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                let thread_id = process * 1_000 + thread;
                let file = process * 100 + thread;
                writer
                    .append(Record::new(
                        thread_id,
                        Operation::Open {
                            fs: 1,
                            path: data_path(process, thread),
                            flags: 0,
                            buffer_size: 4096,
                            replication: 3,
                            block_size: 134_217_728,
                        },
                    ))
                    .unwrap();
                writer
                    .append(Record::new(thread_id, Operation::OpenRet { file }))
                    .unwrap();
                for i in 0..READS {
                    writer
                        .append(Record::new(
                            thread_id,
                            Operation::Read {
                                fs: 1,
                                file,
                                offset: i * READ_LEN,
                                buffer: 0,
                                length: READ_LEN,
                            },
                        ))
                        .unwrap();
                    writer
                        .append(Record::new(thread_id, Operation::ReadRet { code: READ_LEN }))
                        .unwrap();
                }
                writer
                    .append(Record::new(thread_id, Operation::Close { fs: 1, file }))
                    .unwrap();
                writer
                    .append(Record::new(thread_id, Operation::CloseRet { code: 0 }))
                    .unwrap();
            })
        })
        .collect();

    for handle in threads {
        handle.join().unwrap();
    }
    writer.close().unwrap();
}

fn records_per_thread() -> u64 {
    (2 + 2 * READS + 2) as u64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capture_merge_replay() {
    let traces = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    populate(data.path());

    let base = traces.path().join("trace.log");
    std::thread::scope(|scope| {
        for process in 1..=PROCESSES {
            let base = &base;
            scope.spawn(move || capture_process(base, process));
        }
    });

    let merged = out.path().join("merged.log");
    let report = merge_directory(traces.path(), &merged).unwrap();
    let expected = (PROCESSES * THREADS) as u64 * records_per_thread();
    assert_eq!(report.sources.len(), PROCESSES as usize);
    assert_eq!(report.records, expected);

    // The merged trace is globally ordered and complete
    let mut reader = TraceReader::open(&merged).unwrap();
    let summary = TraceSummary::collect(&mut reader);
    assert!(summary.is_complete());
    assert_eq!(summary.records, expected);
    assert_eq!(summary.threads, (PROCESSES * THREADS) as usize);
    assert_eq!(summary.count(OpKind::Read), (PROCESSES * THREADS * READS) as u64);

    let stamps: Vec<i64> = TraceReader::open(&merged)
        .unwrap()
        .map(|r| r.unwrap().epoch_nanos)
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    // Replay it against the local copy of the data
    let backend: Arc<dyn FsBackend> = LocalConnector::new(data.path())
        .connect("namenode", 8020)
        .await
        .unwrap();
    let replayer = Replayer::new(
        Arc::clone(&backend),
        ReplayConfig {
            report_interval: None,
            ..Default::default()
        },
    );
    let replay = replayer.replay(TraceReader::open(&merged).unwrap()).await.unwrap();
    backend.disconnect().await;

    assert_eq!(replay.outcome, ReplayOutcome::Completed);
    assert_eq!(replay.stats.dispatched, expected);
    assert_eq!(replay.stats.opens, (PROCESSES * THREADS) as u64);
    assert_eq!(replay.stats.closes, (PROCESSES * THREADS) as u64);
    assert_eq!(replay.stats.reads, (PROCESSES * THREADS * READS) as u64);
    assert_eq!(
        replay.stats.bytes_read,
        (PROCESSES * THREADS * READS * READ_LEN) as u64
    );
    assert_eq!(replay.stats.backend_errors, 0);
    assert_eq!(replay.stats.missing_handles, 0);
}

#[tokio::test]
async fn test_damaged_process_trace() {
    let traces = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let base = traces.path().join("trace.log");
    capture_process(&base, 1);
    capture_process(&base, 2);

    // Simulate a process dying halfway through its last append
    let victim = process_trace_path(&base, 2);
    let bytes = std::fs::read(&victim).unwrap();
    std::fs::write(&victim, &bytes[..bytes.len() - 2]).unwrap();

    let err = merge_directory(traces.path(), out.path().join("merged.log")).unwrap_err();
    assert!(matches!(err, IoTraceError::Truncated { .. }), "{err}");
    assert!(err.to_string().contains("source #1"), "{err}");

    // Replaying the damaged trace runs every intact record, then reports where it stopped
    let replayer = Replayer::new(
        Arc::new(NullBackend::new()),
        ReplayConfig {
            report_interval: None,
            ..Default::default()
        },
    );
    let report = replayer
        .replay(TraceReader::open(&victim).unwrap())
        .await
        .unwrap();
    let intact = THREADS as u64 * records_per_thread() - 1;
    match &report.outcome {
        ReplayOutcome::Premature { record, .. } => assert_eq!(*record, intact + 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.stats.dispatched, intact);
}

#[test]
fn test_split_trace_converts_to_framed() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log_7.log");
    let index = dir.path().join("index_7.log");

    let split = SplitWriter::create(&log, &index).unwrap();
    let mut written = Vec::new();
    for thread in 1..=3 {
        written.push(
            split
                .append(Record::new(thread, Operation::OpenRet { file: thread * 10 }))
                .unwrap(),
        );
    }
    drop(split);

    // Discovery pairs the split files
    let locations = discover_traces(dir.path(), None).unwrap();
    assert_eq!(
        locations,
        vec![TraceLocation::Split {
            log: log.clone(),
            index: index.clone()
        }]
    );

    let framed = dir.path().join("framed.out");
    let writer = TraceWriter::create(&framed).unwrap();
    let mut reader = SplitReader::open(&log, &index).unwrap();
    while let Some(record) = reader.next_record().unwrap() {
        writer.append_verbatim(&record).unwrap();
    }
    writer.close().unwrap();

    let converted: Vec<Record> = TraceReader::open(&framed)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(converted, written);
}
