//! The mutable write buffer of the index.
//!
//! Entries are grouped by stream hash and kept sorted per hash, so lookups
//! never need a full scan and a flush only has to concatenate the groups.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use super::entry::{sort_for_table, IndexEntry};

#[derive(Debug, Default)]
pub struct MemTable {
    /// `(version, position)` per stream hash, ascending
    streams: HashMap<u64, BTreeSet<(i64, i64)>>,
    count: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, stream: u64, version: i64, position: i64) {
        if self
            .streams
            .entry(stream)
            .or_default()
            .insert((version, position))
        {
            self.count += 1;
        }
    }

    pub fn add_entries(&mut self, entries: &[IndexEntry]) {
        for e in entries {
            self.add(e.stream, e.version, e.position);
        }
    }

    /// Position of `version`, the highest position if there are several
    pub fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64> {
        self.candidates(stream, version).into_iter().next()
    }

    /// Every position recorded for `version`, highest first
    pub fn candidates(&self, stream: u64, version: i64) -> Vec<i64> {
        let Some(set) = self.streams.get(&stream) else {
            return Vec::new();
        };
        set.range((version, i64::MIN)..=(version, i64::MAX))
            .rev()
            .map(|&(_, p)| p)
            .collect()
    }

    pub fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.streams
            .get(&stream)?
            .iter()
            .next_back()
            .map(|&(v, p)| IndexEntry::new(stream, v, p))
    }

    pub fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry> {
        self.streams
            .get(&stream)?
            .iter()
            .next()
            .map(|&(v, p)| IndexEntry::new(stream, v, p))
    }

    /// Entries with `start_version <= version <= end_version`, descending
    pub fn get_range(&self, stream: u64, start_version: i64, end_version: i64) -> Vec<IndexEntry> {
        if start_version > end_version {
            return Vec::new();
        }
        let Some(set) = self.streams.get(&stream) else {
            return Vec::new();
        };
        set.range((
            Bound::Included((start_version, i64::MIN)),
            Bound::Included((end_version, i64::MAX)),
        ))
        .rev()
        .map(|&(v, p)| IndexEntry::new(stream, v, p))
        .collect()
    }

    /// All entries in table order
    pub fn sorted_entries(&self) -> Vec<IndexEntry> {
        let mut out = Vec::with_capacity(self.count);
        for (&stream, set) in &self.streams {
            out.extend(set.iter().map(|&(v, p)| IndexEntry::new(stream, v, p)));
        }
        sort_for_table(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut mem = MemTable::new();
        mem.add(7, 0, 100);
        mem.add(7, 1, 200);
        mem.add(7, 1, 150);
        mem.add(7, 1, 150);
        mem.add(9, 0, 300);

        assert_eq!(mem.count(), 4);
        assert_eq!(mem.try_get_one_value(7, 1), Some(200));
        assert_eq!(mem.candidates(7, 1), vec![200, 150]);
        assert_eq!(mem.try_get_one_value(7, 2), None);
        assert_eq!(mem.try_get_latest_entry(7), Some(IndexEntry::new(7, 1, 200)));
        assert_eq!(mem.try_get_oldest_entry(7), Some(IndexEntry::new(7, 0, 100)));
        assert_eq!(mem.try_get_latest_entry(8), None);
    }

    #[test]
    fn test_range_is_descending_and_inclusive() {
        let mut mem = MemTable::new();
        for v in 0..10 {
            mem.add(1, v, v * 10);
        }
        let range = mem.get_range(1, 3, 5);
        let versions: Vec<i64> = range.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![5, 4, 3]);
        assert!(mem.get_range(1, 5, 3).is_empty());
    }

    #[test]
    fn test_sorted_entries() {
        let mut mem = MemTable::new();
        mem.add(1, 0, 10);
        mem.add(3, 0, 30);
        mem.add(2, 5, 20);
        let keys: Vec<u64> = mem.sorted_entries().iter().map(|e| e.stream).collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }
}
