//! Read access to the log for collaborators: random access by position and
//! sequential iteration in both directions.
//!
//! Every read is bounded by the flushed writer checkpoint, so nothing that
//! could still be lost in a crash is ever returned. A read that races a
//! chunk swap (`STREAMDB_FILE_BEING_DELETED`) re-resolves the chunk through
//! the manager and tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tlog::chunk::{framed_size, RecordReadResult};
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::{ChunkError, ChunkResult};
use crate::tlog::record::LogRecord;

const MAX_READ_ATTEMPTS: usize = 10;

/// Counts what one read source pulled from the log
#[derive(Debug)]
pub struct ReadTracker {
    source: &'static str,
    records: AtomicU64,
    bytes: AtomicU64,
}

impl ReadTracker {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            records: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn records_read(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn track(&self, record_length: i32) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(framed_size(record_length) as u64, Ordering::Relaxed);
    }
}

/// Run `read` again while it fails with a transient error.
fn with_retry<T>(mut read: impl FnMut() -> ChunkResult<T>) -> ChunkResult<T> {
    let mut attempt = 1;
    loop {
        match read() {
            Err(e) if e.is_transient() && attempt < MAX_READ_ATTEMPTS => attempt += 1,
            other => return other,
        }
    }
}

/// Random access reads by global position
#[derive(Clone)]
pub struct LogReader {
    db: Arc<ChunkDb>,
}

impl LogReader {
    pub fn new(db: Arc<ChunkDb>) -> Self {
        Self { db }
    }

    /// End of readable data
    pub fn writer_position(&self) -> i64 {
        self.db.checkpoints().writer.read()
    }

    /// Record at exactly `position`. `next_position` in the result is global.
    pub fn try_read_at(
        &self,
        position: i64,
        could_be_scavenged: bool,
        tracker: &ReadTracker,
    ) -> ChunkResult<Option<RecordReadResult>> {
        if position < 0 {
            return Err(ChunkError::invariant(format!(
                "read at negative position {}",
                position
            )));
        }
        if position >= self.writer_position() {
            return Ok(None);
        }
        let result = with_retry(|| {
            let chunk = self.db.manager().get_chunk_for(position)?;
            let start = chunk.chunk_start_position();
            Ok(chunk
                .try_read_at(position - start, could_be_scavenged)?
                .map(|r| to_global(r, start)))
        })?;
        if let Some(r) = &result {
            tracker.track(r.record_length);
        }
        Ok(result)
    }

    pub fn exists_at(&self, position: i64, _tracker: &ReadTracker) -> ChunkResult<bool> {
        if position < 0 || position >= self.writer_position() {
            return Ok(false);
        }
        let chunk = self.db.manager().get_chunk_for(position)?;
        Ok(chunk.exists_at(position - chunk.chunk_start_position()))
    }

    /// Whether the chunk holding `position` has been scavenged, so a record
    /// missing there may have been removed on purpose
    pub fn is_scavenged_at(&self, position: i64) -> ChunkResult<bool> {
        if position < 0 {
            return Ok(false);
        }
        Ok(self.db.manager().get_chunk_for(position)?.is_scavenged())
    }

    pub fn seq_reader(&self, position: i64) -> SeqReader {
        SeqReader::new(Arc::clone(&self.db), position)
    }
}

fn to_global(mut result: RecordReadResult, chunk_start: i64) -> RecordReadResult {
    result.next_position += chunk_start;
    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqReadResult {
    pub record: LogRecord,
    /// Global position where the record starts
    pub record_pre_position: i64,
    /// Global position right after the record
    pub record_post_position: i64,
}

/// Sequential reader over global positions
pub struct SeqReader {
    db: Arc<ChunkDb>,
    position: i64,
}

impl SeqReader {
    pub fn new(db: Arc<ChunkDb>, position: i64) -> Self {
        Self { db, position }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) {
        self.position = position;
    }

    /// Next record at or after the current position, `None` at the flushed end
    pub fn try_read_next(&mut self, tracker: &ReadTracker) -> ChunkResult<Option<SeqReadResult>> {
        loop {
            let writer = self.db.checkpoints().writer.read();
            if self.position >= writer {
                return Ok(None);
            }
            let position = self.position;
            let (chunk, found) = with_retry(|| {
                let chunk = self.db.manager().get_chunk_for(position)?;
                let found = chunk.try_read_closest_forward(position - chunk.chunk_start_position())?;
                Ok((chunk, found))
            })?;

            let Some(found) = found else {
                if !chunk.is_completed() {
                    return Ok(None);
                }
                self.position = chunk.chunk_end_position();
                continue;
            };

            let start = chunk.chunk_start_position();
            let pre = found.record.log_position();
            let post = start + found.next_position;
            tracker.track(found.record_length);
            self.position = post;
            return Ok(Some(SeqReadResult {
                record: found.record,
                record_pre_position: pre,
                record_post_position: post,
            }));
        }
    }

    /// Last record before the current position, `None` at the start of the log
    pub fn try_read_prev(&mut self, tracker: &ReadTracker) -> ChunkResult<Option<SeqReadResult>> {
        loop {
            let writer = self.db.checkpoints().writer.read();
            self.position = self.position.min(writer);
            if self.position <= 0 {
                return Ok(None);
            }
            let position = self.position;
            let (chunk, found) = with_retry(|| {
                let chunk = self.db.manager().get_chunk_for(position - 1)?;
                let found = chunk.try_read_closest_backward(position - chunk.chunk_start_position())?;
                Ok((chunk, found))
            })?;

            let start = chunk.chunk_start_position();
            let Some(found) = found else {
                if start == 0 {
                    return Ok(None);
                }
                self.position = start;
                continue;
            };

            let pre = start + found.next_position;
            let post = pre + framed_size(found.record_length);
            tracker.track(found.record_length);
            self.position = pre;
            return Ok(Some(SeqReadResult {
                record: found.record,
                record_pre_position: pre,
                record_post_position: post,
            }));
        }
    }
}
