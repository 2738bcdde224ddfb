//! Position map of a scavenged chunk.
//!
//! One 16-byte entry per surviving record: the record's logical position
//! (local to the chunk range) and its actual offset in the compacted data
//! region. Entries are sorted by logical position, which is also the order
//! the scavenger writes them.

pub const POS_MAP_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PosMap {
    pub log_pos: i64,
    pub actual_pos: i64,
}

impl PosMap {
    pub fn new(log_pos: i64, actual_pos: i64) -> Self {
        Self { log_pos, actual_pos }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.log_pos.to_le_bytes());
        out.extend_from_slice(&self.actual_pos.to_le_bytes());
    }

    pub fn from_bytes(buf: &[u8; POS_MAP_SIZE]) -> Self {
        let mut log = [0u8; 8];
        let mut actual = [0u8; 8];
        log.copy_from_slice(&buf[..8]);
        actual.copy_from_slice(&buf[8..]);
        Self {
            log_pos: i64::from_le_bytes(log),
            actual_pos: i64::from_le_bytes(actual),
        }
    }
}

/// Sorted, immutable view over the entries of one chunk
#[derive(Debug, Clone, Default)]
pub struct PosMapTable {
    entries: Vec<PosMap>,
}

impl PosMapTable {
    /// Fails with the index of the first entry out of order
    pub fn new(entries: Vec<PosMap>) -> Result<Self, usize> {
        if let Some(i) = entries
            .windows(2)
            .position(|w| w[0].log_pos >= w[1].log_pos || w[0].actual_pos >= w[1].actual_pos)
        {
            return Err(i + 1);
        }
        Ok(Self { entries })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, usize> {
        let entries = bytes
            .chunks_exact(POS_MAP_SIZE)
            .map(|c| {
                let mut e = [0u8; POS_MAP_SIZE];
                e.copy_from_slice(c);
                PosMap::from_bytes(&e)
            })
            .collect();
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PosMap] {
        &self.entries
    }

    /// Actual offset of the record at exactly `log_pos`
    pub fn actual_position(&self, log_pos: i64) -> Option<i64> {
        self.entries
            .binary_search_by(|e| e.log_pos.cmp(&log_pos))
            .ok()
            .map(|i| self.entries[i].actual_pos)
    }

    /// First entry at or after `log_pos`
    pub fn closest_forward(&self, log_pos: i64) -> Option<PosMap> {
        let i = self.entries.partition_point(|e| e.log_pos < log_pos);
        self.entries.get(i).copied()
    }

    /// Last entry strictly before `log_pos`
    pub fn closest_backward(&self, log_pos: i64) -> Option<PosMap> {
        let i = self.entries.partition_point(|e| e.log_pos < log_pos);
        if i == 0 {
            None
        } else {
            Some(self.entries[i - 1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PosMapTable {
        PosMapTable::new(vec![
            PosMap::new(0, 0),
            PosMap::new(300, 100),
            PosMap::new(900, 220),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_lookup() {
        let t = table();
        assert_eq!(t.actual_position(300), Some(100));
        assert_eq!(t.actual_position(301), None);
        assert_eq!(t.actual_position(-1), None);
    }

    #[test]
    fn test_closest_lookups() {
        let t = table();
        assert_eq!(t.closest_forward(1).map(|e| e.log_pos), Some(300));
        assert_eq!(t.closest_forward(900).map(|e| e.log_pos), Some(900));
        assert_eq!(t.closest_forward(901), None);
        assert_eq!(t.closest_backward(900).map(|e| e.log_pos), Some(300));
        assert_eq!(t.closest_backward(0), None);
    }

    #[test]
    fn test_unsorted_map_is_rejected() {
        let err = PosMapTable::new(vec![PosMap::new(10, 0), PosMap::new(5, 40)]).unwrap_err();
        assert_eq!(err, 1);
    }

    #[test]
    fn test_parse_from_bytes() {
        let mut bytes = Vec::new();
        for e in table().entries() {
            e.write_to(&mut bytes);
        }
        assert_eq!(PosMapTable::parse(&bytes).unwrap().entries(), table().entries());
    }
}
