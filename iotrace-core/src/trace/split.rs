//! Split (legacy) trace format
//!
//! Older captures keep payloads and lengths apart: the log stream holds the
//! raw payloads back to back, the index stream holds one decimal payload
//! length per line. Payloads use the same encoding as the framed format.

use super::codec;
use super::reader::{Terminal, read_byte};
use super::record::{Record, Stamp};
use super::source::RecordSource;
use super::writer::TraceClock;
use crate::error::{IoTraceError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Mutex;

struct SplitState {
    log: File,
    index: File,
    clock: TraceClock,
}

/// Writer for the split format
pub struct SplitWriter {
    state: Mutex<SplitState>,
}

impl SplitWriter {
    /// Create (or truncate) a log/index file pair
    pub fn create(log: impl AsRef<Path>, index: impl AsRef<Path>) -> Result<Self> {
        let open = |path: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        };
        Ok(Self {
            state: Mutex::new(SplitState {
                log: open(log.as_ref())?,
                index: open(index.as_ref())?,
                clock: TraceClock::default(),
            }),
        })
    }

    /// Stamp `record` with the current time and append it
    pub fn append(&self, record: Record) -> Result<Record> {
        let mut state = self.lock()?;
        let stamp = state.clock.stamp(Stamp::now());
        let record = record.with_stamp(stamp);
        Self::write(&mut state, &record)?;
        Ok(record)
    }

    /// Append `record` exactly as given
    pub fn append_verbatim(&self, record: &Record) -> Result<()> {
        let mut state = self.lock()?;
        Self::write(&mut state, record)
    }

    // Index line first: a crash between the two writes leaves a length
    // without its payload, which the reader reports as damage.
    fn write(state: &mut SplitState, record: &Record) -> Result<()> {
        let payload = codec::encode_payload(record);
        writeln!(state.index, "{}", payload.len())?;
        state.index.flush()?;
        state.log.write_all(&payload)?;
        state.log.flush()?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SplitState>> {
        self.state
            .lock()
            .map_err(|_| IoTraceError::Other("split writer lock poisoned".to_string()))
    }
}

/// Reader for the split format
#[derive(Debug)]
pub struct SplitReader<L = BufReader<File>, I = BufReader<File>> {
    log: L,
    index: I,
    offset: u64,
    line: u64,
    terminal: Option<Terminal>,
}

impl SplitReader {
    /// Open a log/index file pair read-only
    pub fn open(log: impl AsRef<Path>, index: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(
            BufReader::new(File::open(log)?),
            BufReader::new(File::open(index)?),
        ))
    }
}

impl<L: Read, I: BufRead> SplitReader<L, I> {
    /// Read from arbitrary log and index streams
    pub fn new(log: L, index: I) -> Self {
        Self {
            log,
            index,
            offset: 0,
            line: 0,
            terminal: None,
        }
    }

    /// Whether both streams ended cleanly
    pub fn is_eof(&self) -> bool {
        matches!(self.terminal, Some(Terminal::End))
    }

    /// Next record, `Ok(None)` at a clean end, `Err` on damage
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(terminal) = &self.terminal {
            return terminal.replay();
        }
        let outcome = self.read_record();
        match &outcome {
            Ok(Some(_)) => {}
            Ok(None) => self.terminal = Some(Terminal::End),
            Err(err) => self.terminal = Some(Terminal::from_error(err)),
        }
        outcome
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        let mut line = String::new();
        if self.index.read_line(&mut line)? == 0 {
            if read_byte(&mut self.log)?.is_some() {
                return Err(IoTraceError::malformed(
                    self.offset,
                    "log stream has bytes no index line accounts for",
                ));
            }
            return Ok(None);
        }
        self.line += 1;

        let Some(digits) = line.strip_suffix('\n') else {
            return Err(IoTraceError::malformed(
                self.offset,
                format!("index line {} is not terminated", self.line),
            ));
        };
        let len: u64 = digits.trim().parse().map_err(|_| {
            IoTraceError::malformed(
                self.offset,
                format!("index line {} is not a length: {digits:?}", self.line),
            )
        })?;
        if len > codec::MAX_PAYLOAD_LEN {
            return Err(IoTraceError::malformed(
                self.offset,
                format!("index line {} declares {len} bytes", self.line),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        self.log.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                IoTraceError::malformed(
                    self.offset,
                    format!("index declares {len} bytes, log stream ended first"),
                )
            } else {
                IoTraceError::Io(e)
            }
        })?;

        let record = codec::decode_payload(&payload, self.offset)?;
        self.offset += len;
        Ok(Some(record))
    }
}

impl<L: Read + Send, I: BufRead + Send> RecordSource for SplitReader<L, I> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        SplitReader::next_record(self)
    }
}

impl<L: Read, I: BufRead> Iterator for SplitReader<L, I> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminal.is_some() {
            return None;
        }
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::record::Operation;
    use std::io::Cursor;

    fn streams(records: &[Record]) -> (Vec<u8>, Vec<u8>) {
        let mut log = Vec::new();
        let mut index = Vec::new();
        for record in records {
            let payload = codec::encode_payload(record);
            index.extend(format!("{}\n", payload.len()).into_bytes());
            log.extend(payload);
        }
        (log, index)
    }

    fn sample() -> Vec<Record> {
        vec![
            Record::new(3, Operation::OpenRet { file: 11 }),
            Record::new(3, Operation::CloseRet { code: 0 }),
        ]
    }

    #[test]
    fn test_reads_back_in_order() {
        let (log, index) = streams(&sample());
        let records: Vec<_> = SplitReader::new(Cursor::new(log), Cursor::new(index))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, sample());
    }

    #[test]
    fn test_missing_payload_is_error() {
        let (mut log, index) = streams(&sample());
        log.pop();
        let mut reader = SplitReader::new(Cursor::new(log), Cursor::new(index));
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn test_unindexed_log_bytes_are_error() {
        let (mut log, index) = streams(&sample());
        log.push(1);
        let mut reader = SplitReader::new(Cursor::new(log), Cursor::new(index));
        reader.next_record().unwrap();
        reader.next_record().unwrap();
        assert!(reader.next_record().is_err());
        assert!(!reader.is_eof());
    }

    #[test]
    fn test_garbage_index_line_is_error() {
        let (log, _) = streams(&sample());
        let mut reader = SplitReader::new(Cursor::new(log), Cursor::new(b"seven\n".to_vec()));
        assert!(reader.next_record().unwrap_err().is_corruption());
    }

    #[test]
    fn test_writer_pairs_with_reader() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("log_1.log");
        let index = dir.path().join("index_1.log");

        let writer = SplitWriter::create(&log, &index).unwrap();
        let first = writer
            .append(Record::new(1, Operation::CloseRet { code: 0 }))
            .unwrap();
        drop(writer);

        let mut reader = SplitReader::open(&log, &index).unwrap();
        assert_eq!(reader.next_record().unwrap(), Some(first));
        assert!(reader.next_record().unwrap().is_none());
        assert!(reader.is_eof());
    }
}
