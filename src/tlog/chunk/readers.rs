//! Bounded pool of reader leases for one chunk.
//!
//! Every read goes through a [`ReaderLease`]. For file-backed chunks that are
//! not memory mapped the lease carries a dedicated read-only file handle, so
//! readers never share a seek position with each other or with the writer.
//!
//! The pool is also the chunk's reference count. After
//! [`ReaderPool::mark_for_deletion`] no new lease is handed out, and the file
//! is removed when the last outstanding lease is returned.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::tlog::errors::{ChunkError, ChunkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderPoolConfig {
    /// Handles opened eagerly when the chunk is opened
    pub initial_reader_count: usize,
    /// Hard bound on concurrent leases
    pub max_reader_count: usize,
    /// How long `acquire` blocks on an exhausted pool
    pub wait_timeout: Duration,
}

impl Default for ReaderPoolConfig {
    fn default() -> Self {
        Self {
            initial_reader_count: 2,
            max_reader_count: 16,
            wait_timeout: Duration::from_millis(5_000),
        }
    }
}

struct PoolState {
    idle: Vec<File>,
    leased: usize,
    /// Leases carry file handles; false for in-memory and mapped chunks
    file_handles: bool,
    marked: bool,
    removed: bool,
}

pub struct ReaderPool {
    chunk: String,
    path: Option<PathBuf>,
    config: ReaderPoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    metrics: Arc<MetricsRegistry>,
}

impl ReaderPool {
    /// `path` is `None` for chunks that live only in memory.
    pub fn new(
        chunk: &str,
        path: Option<PathBuf>,
        config: ReaderPoolConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> ChunkResult<Self> {
        let pool = Self {
            chunk: chunk.to_string(),
            path,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                leased: 0,
                file_handles: false,
                marked: false,
                removed: false,
            }),
            available: Condvar::new(),
            metrics,
        };

        if pool.path.is_some() {
            let mut state = pool.state.lock();
            state.file_handles = true;
            for _ in 0..config.initial_reader_count.min(config.max_reader_count) {
                let handle = pool.open_handle()?;
                state.idle.push(handle);
            }
        }
        Ok(pool)
    }

    fn open_handle(&self) -> ChunkResult<File> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ChunkError::invariant("reader handle requested for in-memory chunk"))?;
        OpenOptions::new().read(true).open(path).map_err(|e| {
            ChunkError::io_failed(
                format!("Failed to open reader handle: {}", path.display()),
                e,
            )
        })
    }

    /// Stop handing out file handles; reads go through the memory map.
    pub fn switch_to_mapped(&self) {
        let mut state = self.state.lock();
        state.file_handles = false;
        state.idle.clear();
    }

    /// Take a lease, blocking up to the configured timeout while the pool is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// - `STREAMDB_FILE_BEING_DELETED` once the chunk is marked for deletion
    /// - `STREAMDB_READER_POOL_EXHAUSTED` if no lease frees up in time
    pub fn acquire(&self) -> ChunkResult<ReaderLease<'_>> {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut state = self.state.lock();
        let mut waited = false;

        loop {
            if state.marked {
                return Err(ChunkError::file_being_deleted(&self.chunk));
            }
            if state.leased < self.config.max_reader_count {
                let handle = if state.file_handles {
                    match state.idle.pop() {
                        Some(h) => Some(h),
                        None => Some(self.open_handle()?),
                    }
                } else {
                    None
                };
                state.leased += 1;
                return Ok(ReaderLease { pool: self, handle });
            }

            if !waited {
                waited = true;
                self.metrics.increment_reader_pool_waits();
            }
            if self.available.wait_until(&mut state, deadline).timed_out()
                && state.leased >= self.config.max_reader_count
            {
                return Err(ChunkError::reader_pool_exhausted(
                    &self.chunk,
                    self.config.wait_timeout.as_millis() as u64,
                ));
            }
        }
    }

    fn release(&self, handle: Option<File>) {
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        if let Some(h) = handle {
            if state.file_handles && !state.marked {
                state.idle.push(h);
            }
        }
        if state.marked && state.leased == 0 {
            self.remove_file(&mut state);
        }
        drop(state);
        self.available.notify_one();
    }

    /// Refuse new leases and delete the file once the last lease is returned
    pub fn mark_for_deletion(&self) {
        let mut state = self.state.lock();
        state.marked = true;
        state.idle.clear();
        if state.leased == 0 {
            self.remove_file(&mut state);
        }
        drop(state);
        self.available.notify_all();
    }

    fn remove_file(&self, state: &mut PoolState) {
        if state.removed {
            return;
        }
        state.removed = true;

        let Some(path) = self.path.as_ref() else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => log_event_with_fields(Event::ChunkDeleted, &[("chunk", &self.chunk)]),
            Err(e) => Logger::warn(
                "CHUNK_DELETE_FAILED",
                &[("chunk", &self.chunk), ("error", &e.to_string())],
            ),
        }
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state.lock().marked
    }

    /// True once the file (if any) has been removed
    pub fn is_deleted(&self) -> bool {
        self.state.lock().removed
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leased
    }
}

/// A reader lease; returned to the pool on drop
pub struct ReaderLease<'a> {
    pool: &'a ReaderPool,
    handle: Option<File>,
}

impl ReaderLease<'_> {
    pub(crate) fn handle_mut(&mut self) -> Option<&mut File> {
        self.handle.as_mut()
    }
}

impl Drop for ReaderLease<'_> {
    fn drop(&mut self) {
        self.pool.release(self.handle.take());
    }
}
