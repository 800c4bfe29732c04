//! File-level tests for trace writers and readers

use super::*;
use std::collections::HashMap;
use std::sync::Arc;

fn read_all(path: &std::path::Path) -> (Vec<Record>, crate::error::Result<()>) {
    let mut reader = TraceReader::open(path).unwrap();
    let mut records = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return (records, Ok(())),
            Err(err) => return (records, Err(err)),
        }
    }
}

#[test]
fn test_concurrent_appends_stay_whole() {
    const THREADS: i64 = 8;
    const PER_THREAD: i64 = 250;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("concurrent.log");
    let writer = Arc::new(TraceWriter::create(&path).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|thread| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    writer
                        .append(Record::new(thread, Operation::ReadRet { code: seq }))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    writer.close().unwrap();
    assert_eq!(writer.records_written(), (THREADS * PER_THREAD) as u64);

    let (records, end) = read_all(&path);
    end.unwrap();
    assert_eq!(records.len(), (THREADS * PER_THREAD) as usize);

    // Each thread's records appear in submission order, and stamps never
    // decrease across the whole file.
    let mut next_seq: HashMap<i64, i64> = HashMap::new();
    let mut last_stamp = i64::MIN;
    for record in &records {
        let Operation::ReadRet { code } = record.operation else {
            panic!("unexpected operation {:?}", record.operation);
        };
        let expected = next_seq.entry(record.thread_id).or_insert(0);
        assert_eq!(code, *expected);
        *expected += 1;

        assert!(record.epoch_nanos >= last_stamp);
        last_stamp = record.epoch_nanos;
    }
}

#[test]
fn test_truncation_anywhere_in_last_frame() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("full.log");
    let writer = TraceWriter::create(&path).unwrap();
    writer
        .append(Record::new(
            5,
            Operation::Open {
                fs: 1,
                path: "/data/input".into(),
                flags: 0,
                buffer_size: 0,
                replication: 0,
                block_size: 0,
            },
        ))
        .unwrap();
    writer
        .append(Record::new(5, Operation::OpenRet { file: 77 }))
        .unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let first_frame = {
        let (_, used) = codec::decode(&bytes).unwrap();
        used
    };

    let cut_path = dir.path().join("cut.log");
    for cut in first_frame + 1..bytes.len() {
        std::fs::write(&cut_path, &bytes[..cut]).unwrap();
        let (records, end) = read_all(&cut_path);
        assert_eq!(records.len(), 1, "cut at {cut}");
        assert!(end.unwrap_err().is_corruption(), "cut at {cut}");
    }

    std::fs::write(&cut_path, &bytes[..first_frame]).unwrap();
    let (records, end) = read_all(&cut_path);
    assert_eq!(records.len(), 1);
    assert!(end.is_ok());
}

#[test]
fn test_trailing_byte_turns_clean_end_into_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("t.log");
    let writer = TraceWriter::create(&path).unwrap();
    for code in 0..3 {
        writer
            .append(Record::new(1, Operation::CloseRet { code }))
            .unwrap();
    }
    writer.close().unwrap();

    let mut reader = TraceReader::open(&path).unwrap();
    while reader.next_record().unwrap().is_some() {}
    assert!(reader.is_eof());

    let mut bytes = std::fs::read(&path).unwrap();
    for extra in [0x00u8, 0x01, 0x80] {
        bytes.push(extra);
        std::fs::write(&path, &bytes).unwrap();
        let (records, end) = read_all(&path);
        assert_eq!(records.len(), 3);
        assert!(end.is_err(), "trailing byte {extra:#x}");
        bytes.pop();
    }
}

#[test]
fn test_process_writer_uses_pid() {
    let dir = tempfile::TempDir::new().unwrap();
    let writer = TraceWriter::create_for_process(dir.path().join("capture.log")).unwrap();
    let expected = format!("capture_{}.log", std::process::id());
    assert_eq!(
        writer.path().file_name().unwrap().to_string_lossy(),
        expected
    );
}

#[test]
fn test_verbatim_preserves_stamps() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("copy.log");
    let original = Record::new(9, Operation::ReadRet { code: 4096 }).with_stamp(Stamp {
        epoch_nanos: 1_234,
        day: 200,
        time: 5_678,
    });

    let writer = TraceWriter::create(&path).unwrap();
    writer.append_verbatim(&original).unwrap();
    writer.close().unwrap();

    let (records, end) = read_all(&path);
    end.unwrap();
    assert_eq!(records, vec![original]);
}
