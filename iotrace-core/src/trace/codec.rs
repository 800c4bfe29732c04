//! Record payload codec and length-prefixed framing
//!
//! On disk every record is `varint(payload_len) || payload`. Varints are
//! LEB128 (7 bits per byte, least significant group first, high bit set on
//! every byte but the last). Signed values are zigzag-mapped first so small
//! negative return codes stay short.
//!
//! Payload layout:
//!
//! ```text
//! u8      operation tag
//! varint  day
//! varint  time
//! zigzag  epoch_nanos
//! zigzag  thread_id
//! varint  argument count
//! zigzag  argument * count
//! [OPEN only] varint path length, path bytes (UTF-8)
//! ```
//!
//! A payload must be consumed exactly; trailing bytes are malformed.

use super::record::{MAX_DAY, OpKind, Operation, Record};
use crate::error::{IoTraceError, Result};

/// Longest LEB128 encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Largest payload a frame may declare
///
/// Real records are a few dozen bytes plus a path; anything beyond this is a
/// corrupt length header, not a record.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 20;

/// Append `value` as a LEB128 varint
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Number of bytes `put_varint` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Outcome of feeding one byte to a [`VarintDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintStep {
    /// More bytes are needed
    More,
    /// The varint is complete
    Done(u64),
}

/// Incremental LEB128 decoder, used where bytes arrive one at a time
#[derive(Debug, Default)]
pub struct VarintDecoder {
    value: u64,
    shift: u32,
    len: usize,
}

impl VarintDecoder {
    /// Feed the next byte
    pub fn push(&mut self, byte: u8) -> std::result::Result<VarintStep, String> {
        if self.len == MAX_VARINT_LEN {
            return Err("varint longer than 10 bytes".to_string());
        }
        let group = u64::from(byte & 0x7F);
        if self.shift == 63 && group > 1 {
            return Err("varint overflows u64".to_string());
        }
        self.value |= group << self.shift;
        self.shift += 7;
        self.len += 1;
        if byte & 0x80 == 0 {
            Ok(VarintStep::Done(self.value))
        } else {
            Ok(VarintStep::More)
        }
    }

    /// Bytes consumed so far
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no byte has been fed yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Decode a varint from the front of `buf`, returning `(value, consumed)`
pub fn get_varint(buf: &[u8]) -> std::result::Result<(u64, usize), String> {
    let mut decoder = VarintDecoder::default();
    for &byte in buf {
        if let VarintStep::Done(value) = decoder.push(byte)? {
            return Ok((value, decoder.len()));
        }
    }
    Err("varint cut short".to_string())
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Serialize a record body (no length prefix)
pub fn encode_payload(record: &Record) -> Vec<u8> {
    let args = record.operation.arguments();
    let mut buf = Vec::with_capacity(32 + record.operation.path().map_or(0, str::len));

    buf.push(record.kind() as u8);
    put_varint(&mut buf, u64::from(record.day));
    put_varint(&mut buf, record.time);
    put_varint(&mut buf, zigzag(record.epoch_nanos));
    put_varint(&mut buf, zigzag(record.thread_id));
    put_varint(&mut buf, args.len() as u64);
    for arg in args {
        put_varint(&mut buf, zigzag(arg));
    }
    if let Some(path) = record.operation.path() {
        put_varint(&mut buf, path.len() as u64);
        buf.extend_from_slice(path.as_bytes());
    }
    buf
}

/// Serialize a record as a complete frame
pub fn encode(record: &Record) -> Vec<u8> {
    let payload = encode_payload(record);
    let mut frame = Vec::with_capacity(payload.len() + varint_len(payload.len() as u64));
    put_varint(&mut frame, payload.len() as u64);
    frame.extend_from_slice(&payload);
    frame
}

/// Parse a record body; `offset` is only used for error reporting
pub fn decode_payload(payload: &[u8], offset: u64) -> Result<Record> {
    PayloadCursor::new(payload)
        .record()
        .map_err(|reason| IoTraceError::malformed(offset, reason))
}

/// Parse one frame from the front of `bytes`, returning the record and the
/// number of bytes the frame occupied
pub fn decode(bytes: &[u8]) -> Result<(Record, usize)> {
    let (len, header) = get_varint(bytes).map_err(|reason| IoTraceError::malformed(0, reason))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(IoTraceError::malformed(
            0,
            format!("frame declares {len} bytes, limit is {MAX_PAYLOAD_LEN}"),
        ));
    }
    let end = header + len as usize;
    let payload = bytes.get(header..end).ok_or_else(|| {
        IoTraceError::malformed(
            0,
            format!(
                "frame declares {len} bytes, only {} remain",
                bytes.len() - header
            ),
        )
    })?;
    Ok((decode_payload(payload, 0)?, end))
}

struct PayloadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> std::result::Result<u8, String> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| "payload ended early".to_string())?;
        self.pos += 1;
        Ok(byte)
    }

    fn varint(&mut self) -> std::result::Result<u64, String> {
        let (value, used) = get_varint(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn signed(&mut self) -> std::result::Result<i64, String> {
        self.varint().map(unzigzag)
    }

    fn bytes(&mut self, len: u64) -> std::result::Result<&'a [u8], String> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining as u64 {
            return Err(format!("field declares {len} bytes, only {remaining} remain"));
        }
        let slice = &self.buf[self.pos..self.pos + len as usize];
        self.pos += len as usize;
        Ok(slice)
    }

    fn record(mut self) -> std::result::Result<Record, String> {
        let kind = OpKind::try_from(self.byte()?)?;

        let day = self.varint()?;
        if day > u64::from(MAX_DAY) {
            return Err(format!("day {day} out of range"));
        }
        let time = self.varint()?;
        let epoch_nanos = self.signed()?;
        let thread_id = self.signed()?;

        let argc = self.varint()?;
        if argc != kind.arity() as u64 {
            return Err(format!(
                "{kind} expects {} arguments, found {argc}",
                kind.arity()
            ));
        }
        let args = (0..argc)
            .map(|_| self.signed())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let path = if kind == OpKind::Open {
            let len = self.varint()?;
            let raw = self.bytes(len)?;
            let path = std::str::from_utf8(raw).map_err(|e| format!("path is not UTF-8: {e}"))?;
            Some(path.to_string())
        } else {
            None
        };

        if self.pos != self.buf.len() {
            return Err(format!(
                "{} trailing bytes after record",
                self.buf.len() - self.pos
            ));
        }

        Ok(Record {
            day: day as u16,
            time,
            epoch_nanos,
            thread_id,
            operation: Operation::from_parts(kind, &args, path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn open_record() -> Record {
        Record {
            day: 364,
            time: 86_399_999_999_999,
            epoch_nanos: 1_420_070_399_999_999_999,
            thread_id: 140_234_112_345_600,
            operation: Operation::Open {
                fs: 0x7f00_dead_beef,
                path: "/user/hive/warehouse/part-00000".to_string(),
                flags: 0,
                buffer_size: 4096,
                replication: 3,
                block_size: 134_217_728,
            },
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u64::MAX / 2, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            assert_eq!(get_varint(&buf).unwrap(), (value, buf.len()));
        }
    }

    #[test]
    fn test_varint_rejects_overlong() {
        assert!(get_varint(&[0xFF; 11]).is_err());
        assert!(get_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]).is_err());
        assert!(get_varint(&[0x80]).is_err());
    }

    #[test]
    fn test_zigzag_keeps_small_negatives_short() {
        let mut buf = Vec::new();
        put_varint(&mut buf, zigzag(-1));
        assert_eq!(buf, vec![0x01]);
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_open_frame_decodes() {
        let record = open_record();
        let frame = encode(&record);
        let (decoded, used) = decode(&frame).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_non_open_has_no_path() {
        let record = Record::new(7, Operation::CloseRet { code: -1 });
        let payload = encode_payload(&record);
        let decoded = decode_payload(&payload, 0).unwrap();
        assert!(decoded.operation.path().is_none());
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let frame = encode(&open_record());
        let err = decode(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, IoTraceError::MalformedRecord { .. }));
    }

    #[test]
    fn test_trailing_payload_bytes_rejected() {
        let mut payload = encode_payload(&Record::new(1, Operation::ReadRet { code: 10 }));
        payload.push(0);
        assert!(decode_payload(&payload, 0).is_err());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let mut payload = encode_payload(&Record::new(1, Operation::OpenRet { file: 3 }));
        // argument count lives right before the single argument
        let argc_at = payload.len() - 2;
        payload[argc_at] = 2;
        payload.push(0);
        assert!(decode_payload(&payload, 0).is_err());
    }

    fn operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            (any::<i64>(), "[ -~]{0,64}", any::<i64>(), any::<i64>(), any::<i64>(), any::<i64>())
                .prop_map(|(fs, path, flags, buffer_size, replication, block_size)| {
                    Operation::Open {
                        fs,
                        path,
                        flags,
                        buffer_size,
                        replication,
                        block_size,
                    }
                }),
            any::<i64>().prop_map(|file| Operation::OpenRet { file }),
            (any::<i64>(), any::<i64>()).prop_map(|(fs, file)| Operation::Close { fs, file }),
            any::<i64>().prop_map(|code| Operation::CloseRet { code }),
            (any::<i64>(), any::<i64>(), any::<i64>(), any::<i64>(), any::<i64>()).prop_map(
                |(fs, file, offset, buffer, length)| Operation::Read {
                    fs,
                    file,
                    offset,
                    buffer,
                    length,
                }
            ),
            any::<i64>().prop_map(|code| Operation::ReadRet { code }),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            day in 0..=MAX_DAY,
            time in any::<u64>(),
            epoch_nanos in any::<i64>(),
            thread_id in any::<i64>(),
            operation in operation(),
        ) {
            let record = Record { day, time, epoch_nanos, thread_id, operation };
            let frame = encode(&record);
            let (decoded, used) = decode(&frame).unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(decoded, record);
        }
    }
}
