//! Sequential trace reader
//!
//! Yields records in on-disk order and tells a clean end of stream apart
//! from a damaged one: a stream that stops exactly on a frame boundary ends
//! cleanly, anything else is an error. Both outcomes are terminal.

use super::codec::{self, MAX_PAYLOAD_LEN, VarintDecoder, VarintStep};
use super::record::Record;
use super::source::RecordSource;
use crate::error::{IoTraceError, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Terminal condition remembered so later calls repeat it
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    End,
    Malformed { offset: u64, reason: String },
    Io { kind: ErrorKind, message: String },
}

impl Terminal {
    pub(crate) fn from_error(err: &IoTraceError) -> Self {
        match err {
            IoTraceError::MalformedRecord { offset, reason } => Terminal::Malformed {
                offset: *offset,
                reason: reason.clone(),
            },
            IoTraceError::Io(e) => Terminal::Io {
                kind: e.kind(),
                message: e.to_string(),
            },
            other => Terminal::Malformed {
                offset: 0,
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn replay(&self) -> Result<Option<Record>> {
        match self {
            Terminal::End => Ok(None),
            Terminal::Malformed { offset, reason } => {
                Err(IoTraceError::malformed(*offset, reason.clone()))
            }
            Terminal::Io { kind, message } => {
                Err(IoTraceError::Io(std::io::Error::new(*kind, message.clone())))
            }
        }
    }
}

/// Reader for the canonical framed trace format
#[derive(Debug)]
pub struct TraceReader<R = BufReader<File>> {
    input: R,
    offset: u64,
    records: u64,
    terminal: Option<Terminal>,
}

impl TraceReader<BufReader<File>> {
    /// Open a trace file read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> TraceReader<R> {
    /// Read frames from any byte stream
    pub fn new(input: R) -> Self {
        Self {
            input,
            offset: 0,
            records: 0,
            terminal: None,
        }
    }

    /// Number of records successfully read
    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Byte offset of the next frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the stream ended cleanly on a frame boundary
    pub fn is_eof(&self) -> bool {
        matches!(self.terminal, Some(Terminal::End))
    }

    /// Whether the reader stopped on an error
    pub fn is_failed(&self) -> bool {
        matches!(
            self.terminal,
            Some(Terminal::Malformed { .. } | Terminal::Io { .. })
        )
    }

    /// Next record, `Ok(None)` at a clean end, `Err` on a damaged stream
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(terminal) = &self.terminal {
            return terminal.replay();
        }

        match self.read_frame() {
            Ok(Some(record)) => {
                self.records += 1;
                Ok(Some(record))
            }
            Ok(None) => {
                self.terminal = Some(Terminal::End);
                Ok(None)
            }
            Err(err) => {
                self.terminal = Some(Terminal::from_error(&err));
                Err(err)
            }
        }
    }

    /// Release the underlying stream
    pub fn close(self) {}

    fn read_frame(&mut self) -> Result<Option<Record>> {
        let frame_start = self.offset;

        let mut header = VarintDecoder::default();
        let len = loop {
            let Some(byte) = read_byte(&mut self.input)? else {
                if header.is_empty() {
                    return Ok(None);
                }
                return Err(IoTraceError::malformed(
                    frame_start,
                    "stream ended inside a length header",
                ));
            };
            self.offset += 1;
            match header
                .push(byte)
                .map_err(|reason| IoTraceError::malformed(frame_start, reason))?
            {
                VarintStep::More => continue,
                VarintStep::Done(len) => break len,
            }
        };

        if len > MAX_PAYLOAD_LEN {
            return Err(IoTraceError::malformed(
                frame_start,
                format!("frame declares {len} bytes, limit is {MAX_PAYLOAD_LEN}"),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        self.input.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                IoTraceError::malformed(
                    frame_start,
                    format!("frame declares {len} bytes, stream ended first"),
                )
            } else {
                IoTraceError::Io(e)
            }
        })?;
        self.offset += len;

        codec::decode_payload(&payload, frame_start).map(Some)
    }
}

pub(crate) fn read_byte<R: Read>(input: &mut R) -> std::io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl<R: Read + Send> RecordSource for TraceReader<R> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        TraceReader::next_record(self)
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminal.is_some() {
            return None;
        }
        self.next_record().transpose()
    }
}
