//! Immutable sorted index tables.
//!
//! File layout:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬───────────┬───────────┐
//! │ header (16)  │ entries (24 each, descending) │ count (8) │ hash (16) │
//! └──────────────┴──────────────────────────────┴───────────┴───────────┘
//! ```
//!
//! Header: magic `SDBPTABL`, format version u8, level u8, 6 reserved bytes.
//! Hash: first 16 bytes of SHA-256 over everything before it.
//!
//! Tables are memory mapped once written. A table that was merged away or
//! replaced by scavenge is marked for deletion; its file is removed when the
//! last `Arc<PTable>` is dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::entry::IndexEntry;
use super::errors::{IndexError, IndexResult};
use crate::observability::{log_event_with_fields, Event, Logger};

pub const PTABLE_MAGIC: &[u8; 8] = b"SDBPTABL";
pub const PTABLE_VERSION: u8 = 1;
pub const PTABLE_HEADER_SIZE: usize = 16;
const COUNT_SIZE: usize = 8;
const HASH_SIZE: usize = 16;
const TRAILER_SIZE: usize = COUNT_SIZE + HASH_SIZE;

enum TableData {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

impl TableData {
    fn bytes(&self) -> &[u8] {
        match self {
            TableData::Mapped(m) => &m[..],
            TableData::Memory(v) => &v[..],
        }
    }
}

pub struct PTable {
    id: Uuid,
    /// `None` for in-memory tables
    path: Option<PathBuf>,
    level: u8,
    data: TableData,
    count: usize,
    marked_for_deletion: AtomicBool,
}

fn encode(entries: &[IndexEntry], level: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PTABLE_HEADER_SIZE + entries.len() * IndexEntry::SIZE + TRAILER_SIZE);
    buf.extend_from_slice(PTABLE_MAGIC);
    buf.push(PTABLE_VERSION);
    buf.push(level);
    buf.extend_from_slice(&[0u8; 6]);
    for e in entries {
        e.write_to(&mut buf);
    }
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&digest[..HASH_SIZE]);
    buf
}

/// Validate layout and optionally the hash; returns `(level, count)`
fn validate(name: &str, bytes: &[u8], verify_hash: bool) -> IndexResult<(u8, usize)> {
    if bytes.len() < PTABLE_HEADER_SIZE + TRAILER_SIZE {
        return Err(IndexError::corrupted(
            name,
            format!("table is {} bytes, too small", bytes.len()),
        ));
    }
    if &bytes[0..8] != PTABLE_MAGIC {
        return Err(IndexError::bad_version(name, "not an index table"));
    }
    if bytes[8] != PTABLE_VERSION {
        return Err(IndexError::bad_version(
            name,
            format!("unsupported table version {}", bytes[8]),
        ));
    }
    let level = bytes[9];

    let count_at = bytes.len() - TRAILER_SIZE;
    let mut raw = [0u8; COUNT_SIZE];
    raw.copy_from_slice(&bytes[count_at..count_at + COUNT_SIZE]);
    let count = u64::from_le_bytes(raw) as usize;
    let expected = PTABLE_HEADER_SIZE
        .checked_add(count.checked_mul(IndexEntry::SIZE).unwrap_or(usize::MAX))
        .and_then(|n| n.checked_add(TRAILER_SIZE));
    if expected != Some(bytes.len()) {
        return Err(IndexError::corrupted(
            name,
            format!("table is {} bytes but claims {} entries", bytes.len(), count),
        ));
    }

    if verify_hash {
        let hash_at = bytes.len() - HASH_SIZE;
        let digest = Sha256::digest(&bytes[..hash_at]);
        if digest[..HASH_SIZE] != bytes[hash_at..] {
            log_event_with_fields(Event::IndexCorruption, &[("table", name)]);
            return Err(IndexError::hash_mismatch(name));
        }
    }
    Ok((level, count))
}

impl PTable {
    /// Write `entries` (already in table order) to a new file in `dir`.
    pub fn create(dir: &Path, entries: &[IndexEntry], level: u8) -> IndexResult<Self> {
        let id = Uuid::new_v4();
        let path = dir.join(Self::file_name(id));
        let bytes = encode(entries, level);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                IndexError::io_failed(format!("Failed to create table: {}", path.display()), e)
            })?;
        file.write_all(&bytes).map_err(|e| {
            IndexError::io_failed(format!("Failed to write table: {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            IndexError::fsync_failed(format!("Failed to fsync table: {}", path.display()), e)
        })?;
        drop(file);

        Self::open(&path, false)
    }

    /// Keep `entries` (already in table order) in memory.
    pub fn in_memory(entries: &[IndexEntry], level: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: None,
            level,
            data: TableData::Memory(encode(entries, level)),
            count: entries.len(),
            marked_for_deletion: AtomicBool::new(false),
        }
    }

    pub fn open(path: &Path, verify_hash: bool) -> IndexResult<Self> {
        let name = path.display().to_string();
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse_file_name)
            .ok_or_else(|| IndexError::corrupted(&name, "table file name is not a table id"))?;

        let file = File::open(path)
            .map_err(|e| IndexError::io_failed(format!("Failed to open table: {}", name), e))?;
        // SAFETY: table files are immutable once written and only removed
        // after the last reader has dropped its handle.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| IndexError::io_failed(format!("Failed to map table: {}", name), e))?;
        let (level, count) = validate(&name, &mmap, verify_hash)?;

        Ok(Self {
            id,
            path: Some(path.to_path_buf()),
            level,
            data: TableData::Mapped(mmap),
            count,
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    pub fn file_name(id: Uuid) -> String {
        format!("ptable-{}", id)
    }

    pub fn parse_file_name(name: &str) -> Option<Uuid> {
        Uuid::parse_str(name.strip_prefix("ptable-")?).ok()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn verify_hash(&self) -> IndexResult<()> {
        validate(&self.id.to_string(), self.data.bytes(), true).map(|_| ())
    }

    pub fn entry_at(&self, index: usize) -> IndexEntry {
        let at = PTABLE_HEADER_SIZE + index * IndexEntry::SIZE;
        let mut raw = [0u8; IndexEntry::SIZE];
        raw.copy_from_slice(&self.data.bytes()[at..at + IndexEntry::SIZE]);
        IndexEntry::from_bytes(&raw)
    }

    /// First index for which `pred` is false; `pred` must be true for a
    /// prefix of the table.
    fn partition_point(&self, pred: impl Fn(&IndexEntry) -> bool) -> usize {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.entry_at(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index of the first entry with key `<= (stream, version, position)`
    pub fn seek(&self, stream: u64, version: i64, position: i64) -> usize {
        let key = (stream, version, position);
        self.partition_point(|e| e.key() > key)
    }

    pub fn candidates(&self, stream: u64, version: i64) -> Vec<i64> {
        self.get_range(stream, version, version)
            .into_iter()
            .map(|e| e.position)
            .collect()
    }

    pub fn try_get_one_value(&self, stream: u64, version: i64) -> Option<i64> {
        let i = self.seek(stream, version, i64::MAX);
        if i < self.count {
            let e = self.entry_at(i);
            if e.stream == stream && e.version == version {
                return Some(e.position);
            }
        }
        None
    }

    pub fn try_get_latest_entry(&self, stream: u64) -> Option<IndexEntry> {
        let i = self.seek(stream, i64::MAX, i64::MAX);
        if i < self.count {
            let e = self.entry_at(i);
            if e.stream == stream {
                return Some(e);
            }
        }
        None
    }

    pub fn try_get_oldest_entry(&self, stream: u64) -> Option<IndexEntry> {
        let end = self.partition_point(|e| e.stream >= stream);
        if end == 0 {
            return None;
        }
        let e = self.entry_at(end - 1);
        (e.stream == stream).then_some(e)
    }

    /// Entries with `start_version <= version <= end_version`, descending
    pub fn get_range(&self, stream: u64, start_version: i64, end_version: i64) -> Vec<IndexEntry> {
        let mut out = Vec::new();
        if start_version > end_version {
            return out;
        }
        let mut i = self.seek(stream, end_version, i64::MAX);
        while i < self.count {
            let e = self.entry_at(i);
            if e.stream != stream || e.version < start_version {
                break;
            }
            out.push(e);
            i += 1;
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.count).map(move |i| self.entry_at(i))
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }
}

impl Drop for PTable {
    fn drop(&mut self) {
        if !self.is_marked_for_deletion() {
            return;
        }
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                Logger::warn(
                    "PTABLE_DELETE_FAILED",
                    &[
                        ("table", &path.display().to_string()),
                        ("error", &e.to_string()),
                    ],
                );
            }
        }
    }
}

impl std::fmt::Debug for PTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PTable")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("count", &self.count)
            .finish()
    }
}
