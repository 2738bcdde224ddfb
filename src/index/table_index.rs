//! LSM index from `(stream hash, event number)` to log position.
//!
//! ```text
//! add ──► MemTable ──(full)──► awaiting ──► PTable level 0
//!                                              │ max_tables_per_level
//!                                              ▼
//!                                     k-way merge into level 1 ...
//! ```
//!
//! Lookups search the MemTable, then MemTables waiting to be written, then
//! tables newest to oldest. The key is a hash, so every lookup can return
//! entries of a colliding stream; callers confirm candidates against the
//! record's stream id.
//!
//! Flush and merge are serialized by one lock. Scavenge reads and rewrites
//! tables outside it and takes it only to publish. Each of them builds a new
//! [`IndexMap`], persists it and only then publishes it, so readers always
//! see a complete table set.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::entry::IndexEntry;
use super::errors::{IndexError, IndexResult};
use super::hasher::StreamHasher;
use super::index_map::IndexMap;
use super::memtable::MemTable;
use super::ptable::PTable;
use crate::config::DbConfig;
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry, ObservationScope};

#[derive(Debug, Clone, Copy)]
pub struct TableIndexOptions {
    pub max_mem_table_size: usize,
    pub max_tables_per_level: usize,
    pub verify_hashes: bool,
}

impl TableIndexOptions {
    pub fn from_config(config: &DbConfig) -> Self {
        Self {
            max_mem_table_size: config.max_mem_table_size,
            max_tables_per_level: config.max_tables_per_level,
            verify_hashes: config.verify_index_hashes,
        }
    }
}

impl Default for TableIndexOptions {
    fn default() -> Self {
        Self {
            max_mem_table_size: 1_000_000,
            max_tables_per_level: 4,
            verify_hashes: true,
        }
    }
}

/// A scavenged copy of `source`
struct TableRewrite {
    source: Arc<PTable>,
    rewritten: Arc<PTable>,
    removed: u64,
}

struct Awaiting {
    table: Arc<MemTable>,
    commit_position: i64,
}

struct IndexState {
    memtable: MemTable,
    mem_commit_position: i64,
    /// Oldest first
    awaiting: Vec<Awaiting>,
    map: Arc<IndexMap>,
}

/// Outcome of an index scavenge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexScavengeResult {
    pub entries_removed: u64,
    pub tables_rewritten: usize,
}

pub struct TableIndex {
    /// `None` keeps every table in memory
    dir: Option<PathBuf>,
    hasher: Arc<dyn StreamHasher>,
    options: TableIndexOptions,
    state: RwLock<IndexState>,
    /// Serializes flush, merge and publishing
    maintenance: Mutex<()>,
    scavenging: Mutex<()>,
    metrics: Arc<MetricsRegistry>,
}

impl TableIndex {
    /// Open the index in `dir` (created if missing), or an in-memory index
    /// when `dir` is `None`. Table files the map does not reference are
    /// leftovers of an interrupted flush, merge or scavenge and are removed.
    pub fn open(
        dir: Option<&Path>,
        hasher: Arc<dyn StreamHasher>,
        options: TableIndexOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> IndexResult<Self> {
        let map = match dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| {
                    IndexError::io_failed(format!("Failed to create {}", dir.display()), e)
                })?;
                let map = IndexMap::load(dir, options.verify_hashes)?;
                for orphan in map.orphaned_files(dir)? {
                    fs::remove_file(&orphan).map_err(|e| {
                        IndexError::io_failed(format!("Failed to remove {}", orphan.display()), e)
                    })?;
                    Logger::warn(
                        "INDEX_ORPHAN_REMOVED",
                        &[("file", &orphan.display().to_string())],
                    );
                }
                map
            }
            None => IndexMap::empty(),
        };
        let commit = map.commit_checkpoint();

        Ok(Self {
            dir: dir.map(Path::to_path_buf),
            hasher,
            options,
            state: RwLock::new(IndexState {
                memtable: MemTable::new(),
                mem_commit_position: commit,
                awaiting: Vec::new(),
                map: Arc::new(map),
            }),
            maintenance: Mutex::new(()),
            scavenging: Mutex::new(()),
            metrics,
        })
    }

    pub fn hash(&self, stream: &str) -> u64 {
        self.hasher.hash(stream)
    }

    /// Highest log position persisted in tables
    pub fn commit_checkpoint(&self) -> i64 {
        self.state.read().map.commit_checkpoint()
    }

    /// Highest log position whose entries were added, persisted or not
    pub fn last_commit_position(&self) -> i64 {
        self.state.read().mem_commit_position
    }

    pub fn table_count(&self) -> usize {
        self.state.read().map.table_count()
    }

    pub fn memtable_count(&self) -> usize {
        self.state.read().memtable.count()
    }

    /// Levels and their table counts, level 0 first
    pub fn level_sizes(&self) -> Vec<usize> {
        self.state.read().map.levels().iter().map(Vec::len).collect()
    }

    pub fn add(&self, commit_position: i64, stream: &str, version: i64, position: i64) -> IndexResult<()> {
        let hash = self.hash(stream);
        self.add_entries(commit_position, &[IndexEntry::new(hash, version, position)])
    }

    /// Add entries produced by the commit at `commit_position`.
    /// Flushes synchronously when the MemTable is full.
    pub fn add_entries(&self, commit_position: i64, entries: &[IndexEntry]) -> IndexResult<()> {
        let full = {
            let mut state = self.state.write();
            state.memtable.add_entries(entries);
            state.mem_commit_position = state.mem_commit_position.max(commit_position);
            state.memtable.count() >= self.options.max_mem_table_size
        };
        if full {
            self.flush_memtable()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Newest candidate for `(stream, version)`, unchecked against collisions
    pub fn get_one(&self, stream: &str, version: i64) -> Option<i64> {
        self.candidates(self.hash(stream), version).into_iter().next()
    }

    /// First candidate accepted by `accept`, searching newest first
    pub fn get_one_checked(
        &self,
        stream: &str,
        version: i64,
        mut accept: impl FnMut(i64) -> bool,
    ) -> Option<i64> {
        self.candidates(self.hash(stream), version)
            .into_iter()
            .find(|&p| accept(p))
    }

    /// Every position recorded for `(hash, version)`, newest source first
    pub fn candidates(&self, hash: u64, version: i64) -> Vec<i64> {
        let state = self.state.read();
        let mut out = state.memtable.candidates(hash, version);
        for awaiting in state.awaiting.iter().rev() {
            out.extend(awaiting.table.candidates(hash, version));
        }
        for table in state.map.tables_newest_first() {
            out.extend(table.candidates(hash, version));
        }
        out
    }

    pub fn try_get_latest_entry(&self, hash: u64) -> Option<IndexEntry> {
        let state = self.state.read();
        let mut best = state.memtable.try_get_latest_entry(hash);
        for awaiting in &state.awaiting {
            best = best.max(awaiting.table.try_get_latest_entry(hash));
        }
        for table in state.map.all_tables() {
            best = best.max(table.try_get_latest_entry(hash));
        }
        best
    }

    pub fn try_get_oldest_entry(&self, hash: u64) -> Option<IndexEntry> {
        let state = self.state.read();
        let sources = std::iter::once(state.memtable.try_get_oldest_entry(hash))
            .chain(state.awaiting.iter().map(|a| a.table.try_get_oldest_entry(hash)))
            .chain(state.map.all_tables().map(|t| t.try_get_oldest_entry(hash)));
        sources.flatten().min()
    }

    /// Lazy descending scan of `start_version..=end_version` over a snapshot
    pub fn range(&self, hash: u64, start_version: i64, end_version: i64) -> IndexRange {
        let state = self.state.read();
        let mut memory = state.memtable.get_range(hash, start_version, end_version);
        for awaiting in &state.awaiting {
            memory.extend(awaiting.table.get_range(hash, start_version, end_version));
        }
        memory.sort_unstable_by(|a, b| b.cmp(a));
        IndexRange::new(
            hash,
            start_version,
            end_version,
            memory,
            state.map.all_tables().cloned().collect(),
        )
    }

    pub fn get_range(&self, hash: u64, start_version: i64, end_version: i64, limit: usize) -> Vec<IndexEntry> {
        self.range(hash, start_version, end_version).take(limit).collect()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Write the MemTable (and any MemTable left over from a failed flush)
    /// as level 0 tables, then merge levels that are over their limit.
    pub fn flush_memtable(&self) -> IndexResult<()> {
        let _guard = self.maintenance.lock();
        {
            let mut state = self.state.write();
            if !state.memtable.is_empty() {
                let table = Arc::new(std::mem::take(&mut state.memtable));
                let commit_position = state.mem_commit_position;
                state.awaiting.push(Awaiting {
                    table,
                    commit_position,
                });
            }
        }

        loop {
            let next = {
                let state = self.state.read();
                state
                    .awaiting
                    .first()
                    .map(|a| (Arc::clone(&a.table), a.commit_position))
            };
            let Some((memtable, commit_position)) = next else { break };

            let entries = memtable.sorted_entries();
            let table = Arc::new(self.write_table(&entries, 0)?);
            let map = self.current_map().with_table(0, table, commit_position);
            self.publish(map)?;
            self.state
                .write()
                .awaiting
                .retain(|a| !Arc::ptr_eq(&a.table, &memtable));

            self.metrics.increment_index_flushes();
            log_event_with_fields(
                Event::IndexFlush,
                &[
                    ("entries", &entries.len().to_string()),
                    ("commit_position", &commit_position.to_string()),
                ],
            );
        }

        self.merge_locked()
    }

    /// Merge every level that holds `max_tables_per_level` tables or more.
    pub fn merge_if_needed(&self) -> IndexResult<()> {
        let _guard = self.maintenance.lock();
        self.merge_locked()
    }

    fn merge_locked(&self) -> IndexResult<()> {
        loop {
            let map = self.current_map();
            let Some(level) = map
                .levels()
                .iter()
                .position(|tables| tables.len() >= self.options.max_tables_per_level)
            else {
                return Ok(());
            };

            let sources = map.levels()[level].clone();
            let merged = merge_tables(&sources);
            let level_out = u8::try_from(level + 1).map_err(|_| {
                IndexError::corrupted("indexmap", format!("level {} out of range", level + 1))
            })?;
            let table = Arc::new(self.write_table(&merged, level_out)?);
            self.publish(map.with_level_merged(level, table))?;
            for old in &sources {
                old.mark_for_deletion();
            }

            self.metrics.increment_index_merges();
            log_event_with_fields(
                Event::IndexMerge,
                &[
                    ("level", &level.to_string()),
                    ("tables", &sources.len().to_string()),
                    ("entries", &merged.len().to_string()),
                ],
            );
        }
    }

    /// Rewrite every table, dropping entries `keep` rejects.
    ///
    /// The rewrite runs over a snapshot of the table set without holding the
    /// maintenance lock, so flushes and merges carry on meanwhile. Publishing
    /// substitutes each rewritten table for its source in the current set;
    /// a source merged away in the meantime keeps its entries until the next
    /// pass. Tables that lose nothing are kept as they are. `cancelled` is
    /// polled between entries; a cancelled pass deletes the tables it wrote
    /// and leaves the published table set unchanged. The MemTable is not
    /// scavenged.
    pub fn scavenge(
        &self,
        mut keep: impl FnMut(&IndexEntry) -> IndexResult<bool>,
        cancelled: impl Fn() -> bool,
    ) -> IndexResult<IndexScavengeResult> {
        let _scavenging = self.scavenging.lock();
        let snapshot = self.current_map();
        let scope = ObservationScope::with_fields(
            "INDEX_SCAVENGE",
            &[("tables", &snapshot.table_count().to_string())],
        );

        let mut rewrites: Vec<TableRewrite> = Vec::new();
        let outcome = (|| {
            for table in snapshot.all_tables() {
                let mut kept = Vec::with_capacity(table.count());
                for entry in table.iter() {
                    if cancelled() {
                        return Err(IndexError::scavenge_cancelled());
                    }
                    if keep(&entry)? {
                        kept.push(entry);
                    }
                }
                if kept.len() == table.count() {
                    continue;
                }
                let rewritten = Arc::new(self.write_table(&kept, table.level())?);
                rewrites.push(TableRewrite {
                    source: Arc::clone(table),
                    rewritten,
                    removed: (table.count() - kept.len()) as u64,
                });
            }
            Ok(())
        })();

        let published = outcome.and_then(|()| self.publish_rewrites(&rewrites));
        let result = match published {
            Ok(result) => result,
            Err(e) => {
                for rewrite in &rewrites {
                    rewrite.rewritten.mark_for_deletion();
                }
                scope.fail(e.message());
                return Err(e);
            }
        };

        self.metrics.increment_index_scavenges();
        log_event_with_fields(
            Event::IndexScavenged,
            &[
                ("entries_removed", &result.entries_removed.to_string()),
                ("tables_rewritten", &result.tables_rewritten.to_string()),
            ],
        );
        scope.complete_with_fields(&[("entries_removed", &result.entries_removed.to_string())]);
        Ok(result)
    }

    /// Swap rewritten tables into the current table set. Rewrites whose
    /// source is no longer published are discarded.
    fn publish_rewrites(&self, rewrites: &[TableRewrite]) -> IndexResult<IndexScavengeResult> {
        let mut result = IndexScavengeResult::default();
        if rewrites.is_empty() {
            return Ok(result);
        }

        let _guard = self.maintenance.lock();
        let current = self.current_map();
        let mut applied: Vec<&TableRewrite> = Vec::new();
        let levels: Vec<Vec<Arc<PTable>>> = current
            .levels()
            .iter()
            .map(|tables| {
                tables
                    .iter()
                    .map(|table| {
                        match rewrites.iter().find(|r| Arc::ptr_eq(&r.source, table)) {
                            Some(rewrite) => {
                                applied.push(rewrite);
                                Arc::clone(&rewrite.rewritten)
                            }
                            None => Arc::clone(table),
                        }
                    })
                    .collect()
            })
            .collect();

        for rewrite in rewrites {
            if !applied.iter().any(|a| Arc::ptr_eq(&a.rewritten, &rewrite.rewritten)) {
                rewrite.rewritten.mark_for_deletion();
                Logger::info(
                    "INDEX_SCAVENGE_REWRITE_DROPPED",
                    &[("table", &rewrite.source.id().to_string())],
                );
            }
        }
        if applied.is_empty() {
            return Ok(result);
        }

        self.publish(current.with_levels(levels))?;
        for rewrite in &applied {
            rewrite.source.mark_for_deletion();
            result.entries_removed += rewrite.removed;
        }
        result.tables_rewritten = applied.len();
        Ok(result)
    }

    fn current_map(&self) -> Arc<IndexMap> {
        Arc::clone(&self.state.read().map)
    }

    fn write_table(&self, entries: &[IndexEntry], level: u8) -> IndexResult<PTable> {
        match &self.dir {
            Some(dir) => PTable::create(dir, entries, level),
            None => Ok(PTable::in_memory(entries, level)),
        }
    }

    /// Persist `map`, then make it visible to readers
    fn publish(&self, map: IndexMap) -> IndexResult<()> {
        if let Some(dir) = &self.dir {
            map.save(dir)?;
        }
        self.state.write().map = Arc::new(map);
        Ok(())
    }
}

/// k-way merge of tables already in table order; exact duplicates dropped
fn merge_tables(tables: &[Arc<PTable>]) -> Vec<IndexEntry> {
    let total: usize = tables.iter().map(|t| t.count()).sum();
    let mut out: Vec<IndexEntry> = Vec::with_capacity(total);
    let mut heap: BinaryHeap<(IndexEntry, Reverse<usize>, usize)> = BinaryHeap::new();
    for (t, table) in tables.iter().enumerate() {
        if table.count() > 0 {
            heap.push((table.entry_at(0), Reverse(t), 0));
        }
    }
    while let Some((entry, Reverse(t), i)) = heap.pop() {
        if out.last() != Some(&entry) {
            out.push(entry);
        }
        if i + 1 < tables[t].count() {
            heap.push((tables[t].entry_at(i + 1), Reverse(t), i + 1));
        }
    }
    out
}

/// Restartable descending scan over one stream hash.
///
/// Holds the table set it was created from, so tables merged or scavenged
/// away in the meantime stay readable until the range is dropped.
pub struct IndexRange {
    hash: u64,
    start_version: i64,
    end_version: i64,
    memory: Vec<IndexEntry>,
    tables: Vec<Arc<PTable>>,
    memory_cursor: usize,
    table_cursors: Vec<usize>,
    last: Option<IndexEntry>,
}

impl IndexRange {
    fn new(
        hash: u64,
        start_version: i64,
        end_version: i64,
        memory: Vec<IndexEntry>,
        tables: Vec<Arc<PTable>>,
    ) -> Self {
        let mut range = Self {
            hash,
            start_version,
            end_version,
            memory,
            tables,
            memory_cursor: 0,
            table_cursors: Vec::new(),
            last: None,
        };
        range.restart();
        range
    }

    /// Start over from the highest version in range
    pub fn restart(&mut self) {
        self.memory_cursor = 0;
        self.last = None;
        self.table_cursors = self
            .tables
            .iter()
            .map(|t| t.seek(self.hash, self.end_version, i64::MAX))
            .collect();
    }

    fn in_range(&self, e: &IndexEntry) -> bool {
        e.stream == self.hash && e.version >= self.start_version && e.version <= self.end_version
    }

    fn peek_table(&self, t: usize) -> Option<IndexEntry> {
        let cursor = self.table_cursors[t];
        let table = &self.tables[t];
        if cursor >= table.count() {
            return None;
        }
        let e = table.entry_at(cursor);
        self.in_range(&e).then_some(e)
    }
}

impl Iterator for IndexRange {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        loop {
            // None: memory, Some(t): table t
            let mut best: Option<(IndexEntry, Option<usize>)> = self
                .memory
                .get(self.memory_cursor)
                .copied()
                .filter(|e| self.in_range(e))
                .map(|e| (e, None));
            for t in 0..self.tables.len() {
                if let Some(e) = self.peek_table(t) {
                    if best.map(|(b, _)| e > b).unwrap_or(true) {
                        best = Some((e, Some(t)));
                    }
                }
            }

            let (entry, source) = best?;
            match source {
                None => self.memory_cursor += 1,
                Some(t) => self.table_cursors[t] += 1,
            }
            if self.last == Some(entry) {
                continue;
            }
            self.last = Some(entry);
            return Some(entry);
        }
    }
}
