//! Trace record types
//!
//! A [`Record`] is one captured filesystem-client event. Its arguments have a
//! fixed shape per [`Operation`] variant, so a record can never carry the
//! wrong number of arguments or a path on anything but an OPEN.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest valid 0-based ordinal day of the year (leap years)
pub const MAX_DAY: u16 = 365;

/// One captured or replayed filesystem event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// 0-based ordinal day of the year at capture time
    pub day: u16,

    /// Nanoseconds since local midnight at capture time
    pub time: u64,

    /// Nanoseconds since the UNIX epoch (UTC) at capture time
    pub epoch_nanos: i64,

    /// Opaque identifier of the capturing execution context
    pub thread_id: i64,

    /// The operation and its arguments
    pub operation: Operation,
}

impl Record {
    /// Create an unstamped record; writers fill in the timestamps
    pub fn new(thread_id: i64, operation: Operation) -> Self {
        Self {
            day: 0,
            time: 0,
            epoch_nanos: 0,
            thread_id,
            operation,
        }
    }

    /// Set all three timestamp fields
    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.day = stamp.day;
        self.time = stamp.time;
        self.epoch_nanos = stamp.epoch_nanos;
        self
    }

    /// The timestamp carried by this record
    pub fn stamp(&self) -> Stamp {
        Stamp {
            epoch_nanos: self.epoch_nanos,
            day: self.day,
            time: self.time,
        }
    }

    /// Operation kind tag
    pub fn kind(&self) -> OpKind {
        self.operation.kind()
    }
}

/// A capture timestamp sampled once and stored three ways
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Stamp {
    /// Nanoseconds since the UNIX epoch; the ordering key
    pub epoch_nanos: i64,

    /// 0-based ordinal day of the year
    pub day: u16,

    /// Nanoseconds since local midnight
    pub time: u64,
}

impl Stamp {
    /// Sample a local wall-clock instant
    pub fn from_datetime<Tz: chrono::TimeZone>(at: &chrono::DateTime<Tz>) -> Self {
        use chrono::{Datelike, Timelike};

        let time = u64::from(at.num_seconds_from_midnight()) * 1_000_000_000
            + u64::from(at.nanosecond());
        Self {
            epoch_nanos: at.timestamp_nanos_opt().unwrap_or(i64::MAX),
            day: at.ordinal0() as u16,
            time,
        }
    }

    /// Current local time
    pub fn now() -> Self {
        Self::from_datetime(&chrono::Local::now())
    }
}

/// Operation kind as stored on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OpKind {
    Open = 0,
    OpenRet = 1,
    Close = 2,
    CloseRet = 3,
    Read = 4,
    ReadRet = 5,
}

impl OpKind {
    /// All kinds in wire order
    pub const ALL: [OpKind; 6] = [
        OpKind::Open,
        OpKind::OpenRet,
        OpKind::Close,
        OpKind::CloseRet,
        OpKind::Read,
        OpKind::ReadRet,
    ];

    /// Number of integer arguments this kind carries
    pub fn arity(self) -> usize {
        match self {
            OpKind::Open => 5,
            OpKind::Close => 2,
            OpKind::Read => 5,
            OpKind::OpenRet | OpKind::CloseRet | OpKind::ReadRet => 1,
        }
    }

    /// Upper-case name, as printed by the original tooling
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Open => "OPEN",
            OpKind::OpenRet => "OPEN_RET",
            OpKind::Close => "CLOSE",
            OpKind::CloseRet => "CLOSE_RET",
            OpKind::Read => "READ",
            OpKind::ReadRet => "READ_RET",
        }
    }
}

impl TryFrom<u8> for OpKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OpKind::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("unknown operation tag {value}"))
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A filesystem-client operation with its fixed-shape arguments
///
/// `fs` and `buffer` are placeholders captured from the client's address
/// space; replay ignores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Open {
        fs: i64,
        path: String,
        flags: i64,
        buffer_size: i64,
        replication: i64,
        block_size: i64,
    },
    OpenRet {
        file: i64,
    },
    Close {
        fs: i64,
        file: i64,
    },
    CloseRet {
        code: i64,
    },
    Read {
        fs: i64,
        file: i64,
        offset: i64,
        buffer: i64,
        length: i64,
    },
    ReadRet {
        code: i64,
    },
}

impl Operation {
    /// Kind tag for this operation
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Open { .. } => OpKind::Open,
            Operation::OpenRet { .. } => OpKind::OpenRet,
            Operation::Close { .. } => OpKind::Close,
            Operation::CloseRet { .. } => OpKind::CloseRet,
            Operation::Read { .. } => OpKind::Read,
            Operation::ReadRet { .. } => OpKind::ReadRet,
        }
    }

    /// Arguments in wire order (see [`OpKind::arity`])
    pub fn arguments(&self) -> Vec<i64> {
        match self {
            Operation::Open {
                fs,
                flags,
                buffer_size,
                replication,
                block_size,
                ..
            } => vec![*fs, *flags, *buffer_size, *replication, *block_size],
            Operation::OpenRet { file } => vec![*file],
            Operation::Close { fs, file } => vec![*fs, *file],
            Operation::CloseRet { code } | Operation::ReadRet { code } => vec![*code],
            Operation::Read {
                fs,
                file,
                offset,
                buffer,
                length,
            } => vec![*fs, *file, *offset, *buffer, *length],
        }
    }

    /// Path, present only on OPEN
    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Open { path, .. } => Some(path),
            _ => None,
        }
    }

    /// File-handle identifier this operation refers to or produces
    pub fn file_id(&self) -> Option<i64> {
        match self {
            Operation::OpenRet { file }
            | Operation::Close { file, .. }
            | Operation::Read { file, .. } => Some(*file),
            _ => None,
        }
    }

    /// Rebuild an operation from its wire parts
    ///
    /// Fails when the argument count does not match the kind, or when a path
    /// is present on anything but OPEN (or absent on OPEN).
    pub fn from_parts(kind: OpKind, args: &[i64], path: Option<String>) -> Result<Self, String> {
        if args.len() != kind.arity() {
            return Err(format!(
                "{kind} expects {} arguments, found {}",
                kind.arity(),
                args.len()
            ));
        }

        let op = match (kind, path) {
            (OpKind::Open, Some(path)) => Operation::Open {
                fs: args[0],
                path,
                flags: args[1],
                buffer_size: args[2],
                replication: args[3],
                block_size: args[4],
            },
            (OpKind::Open, None) => return Err("OPEN without a path".to_string()),
            (other, Some(_)) => return Err(format!("{other} must not carry a path")),
            (OpKind::OpenRet, None) => Operation::OpenRet { file: args[0] },
            (OpKind::Close, None) => Operation::Close {
                fs: args[0],
                file: args[1],
            },
            (OpKind::CloseRet, None) => Operation::CloseRet { code: args[0] },
            (OpKind::Read, None) => Operation::Read {
                fs: args[0],
                file: args[1],
                offset: args[2],
                buffer: args[3],
                length: args[4],
            },
            (OpKind::ReadRet, None) => Operation::ReadRet { code: args[0] },
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_arguments_follow_wire_order() {
        let op = Operation::Read {
            fs: 1,
            file: 2,
            offset: 3,
            buffer: 4,
            length: 5,
        };
        assert_eq!(op.arguments(), vec![1, 2, 3, 4, 5]);
        assert_eq!(op.file_id(), Some(2));
        assert!(op.path().is_none());

        let rebuilt = Operation::from_parts(OpKind::Read, &op.arguments(), None).unwrap();
        assert_eq!(rebuilt, op);
    }

    #[test]
    fn test_from_parts_rejects_bad_shapes() {
        assert!(Operation::from_parts(OpKind::Close, &[1], None).is_err());
        assert!(Operation::from_parts(OpKind::Open, &[1, 2, 3, 4, 5], None).is_err());
        assert!(Operation::from_parts(OpKind::ReadRet, &[1], Some("/x".into())).is_err());
    }

    #[test]
    fn test_kind_tag_conversion() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(OpKind::try_from(6).is_err());
        assert_eq!(OpKind::OpenRet.to_string(), "OPEN_RET");
    }

    #[test]
    fn test_stamp_from_datetime() {
        let at = chrono::Utc.with_ymd_and_hms(2015, 1, 2, 0, 0, 1).unwrap();
        let stamp = Stamp::from_datetime(&at);
        assert_eq!(stamp.day, 1);
        assert_eq!(stamp.time, 1_000_000_000);
        assert_eq!(stamp.epoch_nanos, at.timestamp_nanos_opt().unwrap());
    }
}
