//! Chunk footer: the last 128 bytes of a completed chunk file.
//!
//! ```text
//! offset  size  field
//! 0       1     file type (2 = chunk footer)
//! 1       1     flags (0x01 completed, 0x02 16-byte map entries)
//! 2       8     physical data size (i64)
//! 10      8     logical data size (i64)
//! 18      4     map size in bytes (i32)
//! 22      90    reserved, zero
//! 112     16    content hash
//! ```
//!
//! The content hash is the first 16 bytes of SHA-256 over every byte of the
//! file that precedes it: header, data, position map and the first 112 bytes
//! of the footer.

use sha2::{Digest, Sha256};

use crate::tlog::errors::{ChunkError, ChunkResult};

pub const FOOTER_SIZE: usize = 128;
pub const CHUNK_FOOTER_TYPE: u8 = 2;
pub const HASH_SIZE: usize = 16;
pub const HASH_OFFSET: usize = FOOTER_SIZE - HASH_SIZE;

const FLAG_COMPLETED: u8 = 0x01;
const FLAG_MAP_16_BYTES: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub is_map_16_bytes: bool,
    pub physical_data_size: i64,
    pub logical_data_size: i64,
    pub map_size: i32,
    pub hash: [u8; HASH_SIZE],
}

impl ChunkFooter {
    pub fn new(physical_data_size: i64, logical_data_size: i64, map_count: usize) -> Self {
        Self {
            is_completed: true,
            is_map_16_bytes: true,
            physical_data_size,
            logical_data_size,
            map_size: (map_count * super::posmap::POS_MAP_SIZE) as i32,
            hash: [0u8; HASH_SIZE],
        }
    }

    pub fn map_count(&self) -> usize {
        self.map_size as usize / super::posmap::POS_MAP_SIZE
    }

    /// Footer bytes, hash included
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0] = CHUNK_FOOTER_TYPE;
        let mut flags = 0u8;
        if self.is_completed {
            flags |= FLAG_COMPLETED;
        }
        if self.is_map_16_bytes {
            flags |= FLAG_MAP_16_BYTES;
        }
        buf[1] = flags;
        buf[2..10].copy_from_slice(&self.physical_data_size.to_le_bytes());
        buf[10..18].copy_from_slice(&self.logical_data_size.to_le_bytes());
        buf[18..22].copy_from_slice(&self.map_size.to_le_bytes());
        buf[HASH_OFFSET..].copy_from_slice(&self.hash);
        buf
    }

    pub fn from_bytes(chunk: &str, buf: &[u8]) -> ChunkResult<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(ChunkError::corrupted(chunk, "footer is truncated"));
        }
        if buf[0] != CHUNK_FOOTER_TYPE {
            return Err(ChunkError::corrupted(
                chunk,
                format!("unexpected footer file type {}", buf[0]),
            ));
        }

        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_le_bytes(b)
        };
        let physical_data_size = i64_at(2);
        let logical_data_size = i64_at(10);
        let mut map = [0u8; 4];
        map.copy_from_slice(&buf[18..22]);
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[HASH_OFFSET..FOOTER_SIZE]);

        let footer = Self {
            is_completed: buf[1] & FLAG_COMPLETED != 0,
            is_map_16_bytes: buf[1] & FLAG_MAP_16_BYTES != 0,
            physical_data_size,
            logical_data_size,
            map_size: i32::from_le_bytes(map),
            hash,
        };

        if !footer.is_map_16_bytes && footer.map_size != 0 {
            return Err(ChunkError::bad_version(
                chunk,
                "position map entries must be 16 bytes",
            ));
        }
        if footer.physical_data_size < 0
            || footer.logical_data_size < 0
            || footer.map_size < 0
            || footer.map_size as usize % super::posmap::POS_MAP_SIZE != 0
        {
            return Err(ChunkError::corrupted(
                chunk,
                format!(
                    "invalid footer sizes: physical {}, logical {}, map {}",
                    footer.physical_data_size, footer.logical_data_size, footer.map_size
                ),
            ));
        }
        Ok(footer)
    }

    /// True if `tail` (the last footer-sized block of a file) is a completed footer
    pub fn is_completed_block(tail: &[u8]) -> bool {
        tail.len() >= FOOTER_SIZE && tail[0] == CHUNK_FOOTER_TYPE && tail[1] & FLAG_COMPLETED != 0
    }
}

/// Truncate a finished SHA-256 digest to the stored hash width
pub fn finish_hash(hasher: Sha256) -> [u8; HASH_SIZE] {
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest[..HASH_SIZE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_bytes_round_trip() {
        let mut footer = ChunkFooter::new(1000, 4096, 3);
        footer.hash = [7u8; HASH_SIZE];
        let parsed = ChunkFooter::from_bytes("c", &footer.to_bytes()).unwrap();
        assert_eq!(parsed, footer);
        assert_eq!(parsed.map_count(), 3);
        assert!(ChunkFooter::is_completed_block(&footer.to_bytes()));
    }

    #[test]
    fn test_zeroed_block_is_not_a_footer() {
        let zeros = [0u8; FOOTER_SIZE];
        assert!(!ChunkFooter::is_completed_block(&zeros));
        assert!(ChunkFooter::from_bytes("c", &zeros).is_err());
    }

    #[test]
    fn test_finish_hash_is_prefix_of_sha256() {
        let mut h = Sha256::new();
        h.update(b"abc");
        let short = finish_hash(h);
        let full = Sha256::digest(b"abc");
        assert_eq!(&short[..], &full[..HASH_SIZE]);
    }
}
