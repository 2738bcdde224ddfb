//! Chunk header: the first 128 bytes of every chunk file.
//!
//! ```text
//! offset  size  field
//! 0       1     file type (1 = chunk header)
//! 1       1     format version
//! 2       4     chunk size (i32)
//! 6       4     chunk start number (i32)
//! 10      4     chunk end number (i32)
//! 14      1     is scavenged
//! 15      16    chunk id (UUID)
//! 31      97    reserved, zero
//! ```

use uuid::Uuid;

use crate::tlog::errors::{ChunkError, ChunkResult};

pub const HEADER_SIZE: usize = 128;
pub const CHUNK_HEADER_TYPE: u8 = 1;
pub const CHUNK_FORMAT_VERSION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub chunk_size: i32,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub is_scavenged: bool,
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    pub fn new(chunk_size: i32, start: i32, end: i32, is_scavenged: bool) -> Self {
        Self {
            version: CHUNK_FORMAT_VERSION,
            chunk_size,
            chunk_start_number: start,
            chunk_end_number: end,
            is_scavenged,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Global logical position of the first byte of this chunk
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Global logical position one past the last byte this chunk covers
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Logical bytes covered by the chunk range
    pub fn logical_capacity(&self) -> i64 {
        self.chunk_end_position() - self.chunk_start_position()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = CHUNK_HEADER_TYPE;
        buf[1] = self.version;
        buf[2..6].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.chunk_start_number.to_le_bytes());
        buf[10..14].copy_from_slice(&self.chunk_end_number.to_le_bytes());
        buf[14] = self.is_scavenged as u8;
        buf[15..31].copy_from_slice(self.chunk_id.as_bytes());
        buf
    }

    pub fn from_bytes(chunk: &str, buf: &[u8]) -> ChunkResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ChunkError::corrupted(
                chunk,
                format!("header is {} bytes, expected {}", buf.len(), HEADER_SIZE),
            ));
        }
        if buf[0] != CHUNK_HEADER_TYPE {
            return Err(ChunkError::bad_version(
                chunk,
                format!("unexpected header file type {}", buf[0]),
            ));
        }
        if buf[1] != CHUNK_FORMAT_VERSION {
            return Err(ChunkError::bad_version(
                chunk,
                format!("unsupported chunk format version {}", buf[1]),
            ));
        }

        let read_i32 = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            i32::from_le_bytes(b)
        };
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[15..31]);

        let header = Self {
            version: buf[1],
            chunk_size: read_i32(2),
            chunk_start_number: read_i32(6),
            chunk_end_number: read_i32(10),
            is_scavenged: buf[14] != 0,
            chunk_id: Uuid::from_bytes(id),
        };

        if header.chunk_size <= 0
            || header.chunk_start_number < 0
            || header.chunk_end_number < header.chunk_start_number
        {
            return Err(ChunkError::corrupted(
                chunk,
                format!(
                    "invalid chunk range: size {}, start {}, end {}",
                    header.chunk_size, header.chunk_start_number, header.chunk_end_number
                ),
            ));
        }
        Ok(header)
    }
}
