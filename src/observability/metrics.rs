//! Metrics registry
//!
//! Counters only, monotonic, reset on process start. Every counter is an
//! `AtomicU64` updated with `Relaxed` ordering.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for the log, index and scavenger
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Bytes appended to chunks (framed size)
    bytes_appended: AtomicU64,
    /// Records appended to chunks
    records_appended: AtomicU64,
    /// Writer flushes
    writer_flushes: AtomicU64,
    /// Chunks sealed by the writer
    chunks_completed: AtomicU64,
    /// Scavenged chunks swapped into the manager
    chunks_swapped: AtomicU64,
    /// Times a reader had to wait for a pooled handle
    reader_pool_waits: AtomicU64,
    /// MemTables flushed to PTables
    index_flushes: AtomicU64,
    /// PTable merges
    index_merges: AtomicU64,
    /// Index scavenge passes that rewrote the table set
    index_scavenges: AtomicU64,
    /// Scavenge runs started
    scavenges_started: AtomicU64,
    /// Records kept by scavenge
    records_kept: AtomicU64,
    /// Records discarded by scavenge
    records_discarded: AtomicU64,
    /// Bytes reclaimed by scavenge
    space_saved: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one appended record of `bytes` framed bytes
    pub fn record_append(&self, bytes: u64) {
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
        self.records_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_writer_flushes(&self) {
        self.writer_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_chunks_completed(&self) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_chunks_swapped(&self) {
        self.chunks_swapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reader_pool_waits(&self) {
        self.reader_pool_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_index_flushes(&self) {
        self.index_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_index_merges(&self) {
        self.index_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_index_scavenges(&self) {
        self.index_scavenges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_scavenges_started(&self) {
        self.scavenges_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of scavenging one chunk
    pub fn record_scavenged_chunk(&self, kept: u64, discarded: u64, space_saved: i64) {
        self.records_kept.fetch_add(kept, Ordering::Relaxed);
        self.records_discarded.fetch_add(discarded, Ordering::Relaxed);
        if space_saved > 0 {
            self.space_saved.fetch_add(space_saved as u64, Ordering::Relaxed);
        }
    }

    /// Get current snapshot of all metrics as JSON
    pub fn to_json(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"{{"bytes_appended":{},"records_appended":{},"writer_flushes":{},"chunks_completed":{},"chunks_swapped":{},"reader_pool_waits":{},"index_flushes":{},"index_merges":{},"index_scavenges":{},"scavenges_started":{},"records_kept":{},"records_discarded":{},"space_saved":{}}}"#,
            s.bytes_appended,
            s.records_appended,
            s.writer_flushes,
            s.chunks_completed,
            s.chunks_swapped,
            s.reader_pool_waits,
            s.index_flushes,
            s.index_merges,
            s.index_scavenges,
            s.scavenges_started,
            s.records_kept,
            s.records_discarded,
            s.space_saved,
        )
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            writer_flushes: self.writer_flushes.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            chunks_swapped: self.chunks_swapped.load(Ordering::Relaxed),
            reader_pool_waits: self.reader_pool_waits.load(Ordering::Relaxed),
            index_flushes: self.index_flushes.load(Ordering::Relaxed),
            index_merges: self.index_merges.load(Ordering::Relaxed),
            index_scavenges: self.index_scavenges.load(Ordering::Relaxed),
            scavenges_started: self.scavenges_started.load(Ordering::Relaxed),
            records_kept: self.records_kept.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
            space_saved: self.space_saved.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_appended: u64,
    pub records_appended: u64,
    pub writer_flushes: u64,
    pub chunks_completed: u64,
    pub chunks_swapped: u64,
    pub reader_pool_waits: u64,
    pub index_flushes: u64,
    pub index_merges: u64,
    pub index_scavenges: u64,
    pub scavenges_started: u64,
    pub records_kept: u64,
    pub records_discarded: u64,
    pub space_saved: u64,
}
