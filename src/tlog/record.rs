//! Log records and their binary codec.
//!
//! Every record starts with the same prefix:
//!
//! ```text
//! record_type: u8 | version: u8 | log_position: i64
//! ```
//!
//! followed by the variant body. All integers are little endian. Strings
//! are `u16` length + UTF-8, byte blobs are `i32` length + bytes, UUIDs are
//! 16 raw bytes, timestamps are UTC microseconds as `i64`.
//!
//! Decoding is an exhaustive match over [`RecordType`]; adding a variant is a
//! compile error at every call site that matches on [`LogRecord`].

use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

pub const RECORD_VERSION: u8 = 1;
const PREFIX_SIZE: usize = 1 + 1 + 8;

/// Expected version sentinels used by writers
pub mod expected_version {
    /// Any version, no check
    pub const ANY: i64 = -2;
    /// The stream must not exist yet
    pub const NO_STREAM: i64 = -1;
    pub const INVALID: i64 = -3;
    /// The stream must exist
    pub const STREAM_EXISTS: i64 = -4;
}

/// Event number of a hard-delete tombstone, and the last event number of a
/// hard-deleted stream
pub const DELETED_STREAM: i64 = i64::MAX;

bitflags! {
    /// Prepare record flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrepareFlags: u16 {
        const DATA = 0x01;
        const TRANSACTION_BEGIN = 0x02;
        const TRANSACTION_END = 0x04;
        const STREAM_DELETE = 0x08;
        const IS_COMMITTED = 0x20;
        const IS_JSON = 0x100;

        const SINGLE_WRITE = Self::DATA.bits()
            | Self::TRANSACTION_BEGIN.bits()
            | Self::TRANSACTION_END.bits();
        const DELETE_TOMBSTONE = Self::TRANSACTION_BEGIN.bits()
            | Self::TRANSACTION_END.bits()
            | Self::STREAM_DELETE.bits();
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    #[error("unsupported {kind} record version {version}")]
    UnsupportedVersion { kind: &'static str, version: u8 },

    #[error("unknown system record type {0}")]
    UnknownSystemRecordType(u8),

    #[error("unknown system record serialization {0}")]
    UnknownSerialization(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("{field} is {len} bytes, limit is {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("{0} trailing bytes after record body")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 0,
    Commit = 1,
    System = 2,
    PartitionType = 3,
    StreamType = 4,
}

impl RecordType {
    fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(RecordType::Prepare),
            1 => Ok(RecordType::Commit),
            2 => Ok(RecordType::System),
            3 => Ok(RecordType::PartitionType),
            4 => Ok(RecordType::StreamType),
            other => Err(CodecError::UnknownRecordType(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Prepare => "prepare",
            RecordType::Commit => "commit",
            RecordType::System => "system",
            RecordType::PartitionType => "partition_type",
            RecordType::StreamType => "stream_type",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Drop sub-microsecond precision so a timestamp survives encoding unchanged
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    micros_to_timestamp(ts.timestamp_micros()).unwrap_or(ts)
}

fn micros_to_timestamp(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// One event (or a stream delete) written as part of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    pub log_position: i64,
    pub flags: PrepareFlags,
    /// Position of the first prepare of the transaction
    pub transaction_position: i64,
    /// Index of this prepare within its transaction
    pub transaction_offset: i32,
    pub expected_version: i64,
    pub event_stream_id: String,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl PrepareRecord {
    /// A prepare not yet placed in the log. The writer stamps `log_position`,
    /// and `transaction_position` too while it still equals `log_position`.
    pub fn new(
        event_stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Vec<u8>,
        metadata: Vec<u8>,
        flags: PrepareFlags,
    ) -> Self {
        Self {
            log_position: -1,
            flags,
            transaction_position: -1,
            transaction_offset: 0,
            expected_version,
            event_stream_id: event_stream_id.into(),
            event_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            timestamp: truncate_to_micros(Utc::now()),
            event_type: event_type.into(),
            data,
            metadata,
        }
    }

    /// Committed-in-place single event write
    pub fn single_write(
        event_stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self::new(
            event_stream_id,
            expected_version,
            event_type,
            data,
            Vec::new(),
            PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_COMMITTED,
        )
    }

    pub fn is_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }

    /// Event number of a prepare that carries its own commit
    pub fn event_number(&self) -> Option<i64> {
        if self.is_committed() {
            Some(self.expected_version.saturating_add(1))
        } else {
            None
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.transaction_position.to_le_bytes());
        out.extend_from_slice(&self.transaction_offset.to_le_bytes());
        out.extend_from_slice(&self.expected_version.to_le_bytes());
        put_string(out, "event_stream_id", &self.event_stream_id)?;
        out.extend_from_slice(self.event_id.as_bytes());
        out.extend_from_slice(self.correlation_id.as_bytes());
        out.extend_from_slice(&self.timestamp.timestamp_micros().to_le_bytes());
        put_string(out, "event_type", &self.event_type)?;
        put_bytes(out, "data", &self.data)?;
        put_bytes(out, "metadata", &self.metadata)
    }

    fn decode_body(log_position: i64, r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            log_position,
            flags: PrepareFlags::from_bits_retain(r.u16()?),
            transaction_position: r.i64()?,
            transaction_offset: r.i32()?,
            expected_version: r.i64()?,
            event_stream_id: r.string("event_stream_id")?,
            event_id: r.uuid()?,
            correlation_id: r.uuid()?,
            timestamp: r.timestamp()?,
            event_type: r.string("event_type")?,
            data: r.bytes()?,
            metadata: r.bytes()?,
        })
    }
}

/// Commit of an explicit transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    pub sort_key: i64,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl CommitRecord {
    pub fn new(transaction_position: i64, first_event_number: i64) -> Self {
        Self {
            log_position: -1,
            transaction_position,
            first_event_number,
            sort_key: 0,
            correlation_id: Uuid::new_v4(),
            timestamp: truncate_to_micros(Utc::now()),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.transaction_position.to_le_bytes());
        out.extend_from_slice(&self.first_event_number.to_le_bytes());
        out.extend_from_slice(&self.sort_key.to_le_bytes());
        out.extend_from_slice(self.correlation_id.as_bytes());
        out.extend_from_slice(&self.timestamp.timestamp_micros().to_le_bytes());
    }

    fn decode_body(log_position: i64, r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            log_position,
            transaction_position: r.i64()?,
            first_event_number: r.i64()?,
            sort_key: r.i64()?,
            correlation_id: r.uuid()?,
            timestamp: r.timestamp()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemRecordType {
    Epoch = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemRecordSerialization {
    Json = 1,
    Binary = 2,
}

/// Administrative record, e.g. an epoch marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    pub log_position: i64,
    pub timestamp: DateTime<Utc>,
    pub system_record_type: SystemRecordType,
    pub serialization: SystemRecordSerialization,
    pub data: Vec<u8>,
}

impl SystemRecord {
    pub fn epoch(data: Vec<u8>) -> Self {
        Self {
            log_position: -1,
            timestamp: truncate_to_micros(Utc::now()),
            system_record_type: SystemRecordType::Epoch,
            serialization: SystemRecordSerialization::Json,
            data,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.timestamp.timestamp_micros().to_le_bytes());
        out.push(self.system_record_type as u8);
        out.push(self.serialization as u8);
        put_bytes(out, "data", &self.data)
    }

    fn decode_body(log_position: i64, r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let timestamp = r.timestamp()?;
        let system_record_type = match r.u8()? {
            0 => SystemRecordType::Epoch,
            other => return Err(CodecError::UnknownSystemRecordType(other)),
        };
        let serialization = match r.u8()? {
            1 => SystemRecordSerialization::Json,
            2 => SystemRecordSerialization::Binary,
            other => return Err(CodecError::UnknownSerialization(other)),
        };
        Ok(Self {
            log_position,
            timestamp,
            system_record_type,
            serialization,
            data: r.bytes()?,
        })
    }
}

/// Declares a partition type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTypeRecord {
    pub log_position: i64,
    pub timestamp: DateTime<Utc>,
    pub partition_type_id: Uuid,
    pub name: String,
}

/// Declares a stream type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTypeRecord {
    pub log_position: i64,
    pub timestamp: DateTime<Utc>,
    pub stream_type_id: Uuid,
    pub name: String,
}

fn encode_named(
    out: &mut Vec<u8>,
    timestamp: &DateTime<Utc>,
    id: &Uuid,
    name: &str,
) -> Result<(), CodecError> {
    out.extend_from_slice(&timestamp.timestamp_micros().to_le_bytes());
    out.extend_from_slice(id.as_bytes());
    put_string(out, "name", name)
}

/// A record in the transaction log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    System(SystemRecord),
    PartitionType(PartitionTypeRecord),
    StreamType(StreamTypeRecord),
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Commit(_) => RecordType::Commit,
            LogRecord::System(_) => RecordType::System,
            LogRecord::PartitionType(_) => RecordType::PartitionType,
            LogRecord::StreamType(_) => RecordType::StreamType,
        }
    }

    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(r) => r.log_position,
            LogRecord::Commit(r) => r.log_position,
            LogRecord::System(r) => r.log_position,
            LogRecord::PartitionType(r) => r.log_position,
            LogRecord::StreamType(r) => r.log_position,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Prepare(r) => r.timestamp,
            LogRecord::Commit(r) => r.timestamp,
            LogRecord::System(r) => r.timestamp,
            LogRecord::PartitionType(r) => r.timestamp,
            LogRecord::StreamType(r) => r.timestamp,
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            _ => None,
        }
    }

    /// Place the record at `position`. A prepare whose transaction position
    /// pointed at its own old position (first prepare of a transaction)
    /// moves with it.
    pub fn rebase(&mut self, position: i64) {
        match self {
            LogRecord::Prepare(r) => {
                if r.transaction_position == r.log_position {
                    r.transaction_position = position;
                }
                r.log_position = position;
            }
            LogRecord::Commit(r) => r.log_position = position,
            LogRecord::System(r) => r.log_position = position,
            LogRecord::PartitionType(r) => r.log_position = position,
            LogRecord::StreamType(r) => r.log_position = position,
        }
    }

    /// Append the encoded record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(self.record_type() as u8);
        out.push(RECORD_VERSION);
        out.extend_from_slice(&self.log_position().to_le_bytes());
        match self {
            LogRecord::Prepare(r) => r.encode_body(out),
            LogRecord::Commit(r) => {
                r.encode_body(out);
                Ok(())
            }
            LogRecord::System(r) => r.encode_body(out),
            LogRecord::PartitionType(r) => {
                encode_named(out, &r.timestamp, &r.partition_type_id, &r.name)
            }
            LogRecord::StreamType(r) => encode_named(out, &r.timestamp, &r.stream_type_id, &r.name),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(128);
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decode exactly one record occupying all of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(bytes);
        let record_type = RecordType::from_u8(r.u8()?)?;
        let version = r.u8()?;
        if version != RECORD_VERSION {
            return Err(CodecError::UnsupportedVersion {
                kind: record_type.as_str(),
                version,
            });
        }
        let log_position = r.i64()?;

        let record = match record_type {
            RecordType::Prepare => LogRecord::Prepare(PrepareRecord::decode_body(log_position, &mut r)?),
            RecordType::Commit => LogRecord::Commit(CommitRecord::decode_body(log_position, &mut r)?),
            RecordType::System => LogRecord::System(SystemRecord::decode_body(log_position, &mut r)?),
            RecordType::PartitionType => LogRecord::PartitionType(PartitionTypeRecord {
                log_position,
                timestamp: r.timestamp()?,
                partition_type_id: r.uuid()?,
                name: r.string("name")?,
            }),
            RecordType::StreamType => LogRecord::StreamType(StreamTypeRecord {
                log_position,
                timestamp: r.timestamp()?,
                stream_type_id: r.uuid()?,
                name: r.string("name")?,
            }),
        };

        if r.remaining() != 0 {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }
        Ok(record)
    }
}

fn put_string(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), CodecError> {
    let len = value.len();
    if len > u16::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field,
            len,
            limit: u16::MAX as usize,
        });
    }
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, field: &'static str, value: &[u8]) -> Result<(), CodecError> {
    let len = value.len();
    if len > i32::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field,
            len,
            limit: i32::MAX as usize,
        });
    }
    out.extend_from_slice(&(len as i32).to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Bounds-checked little-endian cursor
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn uuid(&mut self) -> Result<Uuid, CodecError> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, CodecError> {
        let micros = self.i64()?;
        micros_to_timestamp(micros).ok_or(CodecError::InvalidTimestamp(micros))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: 0,
                available: self.remaining(),
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }
}

/// Size of the fixed prefix every record starts with
pub const fn record_prefix_size() -> usize {
    PREFIX_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(stream: &str, expected: i64) -> PrepareRecord {
        let mut p = PrepareRecord::single_write(stream, expected, "OrderPlaced", br#"{"qty":3}"#.to_vec());
        p.metadata = b"meta".to_vec();
        p.flags |= PrepareFlags::IS_JSON;
        p.log_position = 4096;
        p.transaction_position = 4096;
        p
    }

    #[test]
    fn test_flag_composites() {
        assert_eq!(PrepareFlags::SINGLE_WRITE.bits(), 0x07);
        assert_eq!(PrepareFlags::DELETE_TOMBSTONE.bits(), 0x0E);
        assert!(PrepareFlags::DELETE_TOMBSTONE.contains(PrepareFlags::STREAM_DELETE));
        assert!(!PrepareFlags::DELETE_TOMBSTONE.contains(PrepareFlags::DATA));
    }

    #[test]
    fn test_prepare_round_trip() {
        let record = LogRecord::Prepare(prepare("orders-1", 4));
        let bytes = record.encode().unwrap();
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_commit_and_structural_round_trip() {
        let mut commit = CommitRecord::new(100, 7);
        commit.log_position = 900;
        let records = vec![
            LogRecord::Commit(commit),
            LogRecord::System(SystemRecord::epoch(br#"{"epoch_number":0}"#.to_vec())),
            LogRecord::PartitionType(PartitionTypeRecord {
                log_position: 10,
                timestamp: truncate_to_micros(Utc::now()),
                partition_type_id: Uuid::new_v4(),
                name: "root".to_string(),
            }),
            LogRecord::StreamType(StreamTypeRecord {
                log_position: 20,
                timestamp: truncate_to_micros(Utc::now()),
                stream_type_id: Uuid::new_v4(),
                name: "orders".to_string(),
            }),
        ];

        for record in records {
            let bytes = record.encode().unwrap();
            assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_event_number_only_for_committed_prepares() {
        let p = prepare("s", 4);
        assert_eq!(p.event_number(), Some(5));

        let mut uncommitted = p.clone();
        uncommitted.flags.remove(PrepareFlags::IS_COMMITTED);
        assert_eq!(uncommitted.event_number(), None);
    }

    #[test]
    fn test_rebase_moves_self_transaction_position() {
        let mut first = LogRecord::Prepare(PrepareRecord::single_write("s", -1, "e", vec![]));
        first.rebase(300);
        let p = first.as_prepare().unwrap();
        assert_eq!(p.log_position, 300);
        assert_eq!(p.transaction_position, 300);

        let mut second = LogRecord::Prepare(PrepareRecord {
            transaction_position: 300,
            ..PrepareRecord::new("s", 0, "e", vec![], vec![], PrepareFlags::DATA)
        });
        second.rebase(420);
        let p = second.as_prepare().unwrap();
        assert_eq!(p.log_position, 420);
        assert_eq!(p.transaction_position, 300);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let bytes = LogRecord::Prepare(prepare("s", 0)).encode().unwrap();
        let err = LogRecord::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_unknown_type_and_version_are_rejected() {
        let mut bytes = LogRecord::Prepare(prepare("s", 0)).encode().unwrap();
        bytes[1] = 9;
        assert!(matches!(
            LogRecord::decode(&bytes).unwrap_err(),
            CodecError::UnsupportedVersion { version: 9, .. }
        ));

        bytes[0] = 42;
        assert_eq!(
            LogRecord::decode(&bytes).unwrap_err(),
            CodecError::UnknownRecordType(42)
        );
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = LogRecord::Prepare(prepare("s", 0)).encode().unwrap();
        bytes.push(0);
        assert_eq!(LogRecord::decode(&bytes).unwrap_err(), CodecError::TrailingBytes(1));
    }
}
