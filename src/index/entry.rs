//! Index entries.
//!
//! An entry maps `(stream hash, event number)` to the log position of the
//! event's prepare. Tables keep entries in descending order, so the newest
//! version of a stream comes first.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    /// Hash of the stream name, not unique across streams
    pub stream: u64,
    pub version: i64,
    pub position: i64,
}

impl IndexEntry {
    pub const SIZE: usize = 24;

    pub fn new(stream: u64, version: i64, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    pub fn key(&self) -> (u64, i64, i64) {
        (self.stream, self.version, self.position)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stream.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut u = [0u8; 8];
        u.copy_from_slice(&bytes[0..8]);
        let stream = u64::from_le_bytes(u);
        u.copy_from_slice(&bytes[8..16]);
        let version = i64::from_le_bytes(u);
        u.copy_from_slice(&bytes[16..24]);
        let position = i64::from_le_bytes(u);
        Self::new(stream, version, position)
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort into table order: descending, exact duplicates removed.
pub fn sort_for_table(entries: &mut Vec<IndexEntry>) {
    entries.sort_unstable_by(|a, b| b.cmp(a));
    entries.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_is_descending() {
        let mut entries = vec![
            IndexEntry::new(1, 0, 10),
            IndexEntry::new(2, 0, 20),
            IndexEntry::new(1, 1, 30),
            IndexEntry::new(1, 1, 30),
            IndexEntry::new(1, 1, 25),
        ];
        sort_for_table(&mut entries);
        assert_eq!(
            entries,
            vec![
                IndexEntry::new(2, 0, 20),
                IndexEntry::new(1, 1, 30),
                IndexEntry::new(1, 1, 25),
                IndexEntry::new(1, 0, 10),
            ]
        );
    }

    #[test]
    fn test_bytes_layout() {
        let entry = IndexEntry::new(u64::MAX, -1, 4096);
        let mut out = Vec::new();
        entry.write_to(&mut out);
        assert_eq!(out.len(), IndexEntry::SIZE);
        let arr: [u8; IndexEntry::SIZE] = out.try_into().unwrap();
        assert_eq!(IndexEntry::from_bytes(&arr), entry);
    }
}
