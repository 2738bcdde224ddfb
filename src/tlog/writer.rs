//! The single append path into the log.
//!
//! Every record is stamped with the global position it lands at. When the
//! writable chunk reports `Full`, the writer seals it, moves the writer
//! checkpoint to the chunk end, opens the next chunk and retries once.
//!
//! The writer checkpoint is written after every append but only flushed by
//! [`LogWriter::flush`], after the chunk data it covers was fsynced.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::FlushedPosition;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{Event, Logger};
use crate::tlog::buffer_pool::BufferPool;
use crate::tlog::chunk::{AppendResult, Chunk};
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::{ChunkError, ChunkResult};
use crate::tlog::record::LogRecord;

/// Where a record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordWritten {
    /// Global position of the record
    pub log_position: i64,
    /// Global position right after the record
    pub new_position: i64,
}

struct WriterInner {
    chunk: Arc<Chunk>,
    position: i64,
}

pub struct LogWriter {
    db: Arc<ChunkDb>,
    inner: Mutex<WriterInner>,
    buffers: BufferPool,
}

impl LogWriter {
    /// Attach to the writable chunk of an opened database.
    pub fn open(db: Arc<ChunkDb>) -> ChunkResult<Self> {
        let chunk = db
            .manager()
            .last_chunk()
            .ok_or_else(|| ChunkError::invariant("database has no chunks"))?;
        if chunk.is_completed() {
            return Err(ChunkError::invariant(format!(
                "last chunk {} is completed, no writable chunk",
                chunk.name()
            )));
        }
        let position = db.checkpoints().writer.read();
        let chunk_end = chunk.chunk_start_position() + chunk.physical_data_size();
        if position != chunk_end {
            return Err(ChunkError::invariant(format!(
                "writer checkpoint {} does not match end of chunk {} at {}",
                position,
                chunk.name(),
                chunk_end
            )));
        }
        Ok(Self {
            db,
            inner: Mutex::new(WriterInner { chunk, position }),
            buffers: BufferPool::default(),
        })
    }

    /// Global position the next record will be written at
    pub fn position(&self) -> i64 {
        self.inner.lock().position
    }

    pub fn write(&self, mut record: LogRecord) -> ChunkResult<RecordWritten> {
        let mut inner = self.inner.lock();
        let mut buf = self.buffers.acquire();

        record.rebase(inner.position);
        let mut result = inner.chunk.try_append_buffered(&record, &mut buf)?;

        if result == AppendResult::Full {
            let framed = buf.len();
            let chunk_size = self.db.chunk_size() as i64;
            if framed as i64 > chunk_size {
                return Err(ChunkError::record_too_large(framed, chunk_size));
            }
            self.complete_locked(&mut inner)?;
            record.rebase(inner.position);
            result = inner.chunk.try_append_buffered(&record, &mut buf)?;
        }

        let AppendResult::Written { old_position, new_position } = result else {
            return Err(ChunkError::record_too_large(buf.len(), self.db.chunk_size() as i64));
        };

        let start = inner.chunk.chunk_start_position();
        let written = RecordWritten {
            log_position: start + old_position,
            new_position: start + new_position,
        };
        inner.position = written.new_position;
        self.db.checkpoints().writer.write(written.new_position);
        maybe_crash(points::WRITER_AFTER_APPEND);

        self.db
            .metrics()
            .record_append((new_position - old_position) as u64);
        Ok(written)
    }

    /// Make everything written so far durable and publish it.
    pub fn flush(&self) -> ChunkResult<FlushedPosition> {
        let inner = self.inner.lock();
        inner.chunk.flush()?;
        maybe_crash(points::WRITER_AFTER_CHUNK_FLUSH);

        let flushed = self.db.checkpoints().writer.flush()?;
        maybe_crash(points::WRITER_AFTER_CHECKPOINT_FLUSH);

        self.db.metrics().increment_writer_flushes();
        Logger::trace(
            Event::WriterFlush.as_str(),
            &[("position", &flushed.value().to_string())],
        );
        Ok(flushed)
    }

    /// Seal the writable chunk even if it is not full and open the next one.
    pub fn complete_chunk(&self) -> ChunkResult<FlushedPosition> {
        let mut inner = self.inner.lock();
        self.complete_locked(&mut inner)
    }

    fn complete_locked(&self, inner: &mut WriterInner) -> ChunkResult<FlushedPosition> {
        let checkpoints = self.db.checkpoints();
        inner.chunk.complete()?;

        let end = inner.chunk.chunk_end_position();
        checkpoints.writer.write(end);
        let flushed = checkpoints.writer.flush()?;

        inner.chunk = self.db.manager().add_new_chunk()?;
        inner.position = end;
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::config::DbConfig;
    use crate::observability::MetricsRegistry;
    use crate::tlog::errors::ChunkErrorCode;
    use crate::tlog::record::PrepareRecord;
    use tempfile::TempDir;

    fn in_memory_writer(chunk_size: i32) -> (Arc<ChunkDb>, LogWriter) {
        let db = Arc::new(
            ChunkDb::open(
                &DbConfig::in_memory(chunk_size),
                CheckpointSet::in_memory(),
                Arc::new(MetricsRegistry::new()),
            )
            .unwrap(),
        );
        let writer = LogWriter::open(Arc::clone(&db)).unwrap();
        (db, writer)
    }

    fn event(size: usize) -> LogRecord {
        LogRecord::Prepare(PrepareRecord::single_write("stream", -1, "type", vec![0xAB; size]))
    }

    #[test]
    fn test_write_stamps_positions() {
        let (db, writer) = in_memory_writer(4096);
        let first = writer.write(event(10)).unwrap();
        let second = writer.write(event(10)).unwrap();

        assert_eq!(first.log_position, 0);
        assert_eq!(second.log_position, first.new_position);
        assert_eq!(writer.position(), second.new_position);
        // not yet visible
        assert_eq!(db.checkpoints().writer.read(), 0);

        let flushed = writer.flush().unwrap();
        assert_eq!(flushed.value(), second.new_position);
        assert_eq!(db.checkpoints().writer.read(), second.new_position);
    }

    #[test]
    fn test_rollover_starts_at_chunk_boundary() {
        let (db, writer) = in_memory_writer(1024);
        let mut last = None;
        for _ in 0..10 {
            last = Some(writer.write(event(200)).unwrap());
        }
        let last = last.unwrap();

        assert!(db.manager().chunks_count() > 1);
        let first_chunk = db.manager().get_chunk(0).unwrap();
        assert!(first_chunk.is_completed());

        let second = db.manager().get_chunk(1).unwrap();
        let first_in_second = second.try_read_first().unwrap().unwrap();
        assert_eq!(first_in_second.record.log_position(), 1024);
        assert!(last.log_position >= 1024);
    }

    #[test]
    fn test_record_too_large() {
        let (_db, writer) = in_memory_writer(1024);
        let err = writer.write(event(2000)).unwrap_err();
        assert_eq!(err.code(), ChunkErrorCode::RecordTooLarge);
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn test_complete_chunk_moves_checkpoint_to_chunk_end() {
        let (db, writer) = in_memory_writer(4096);
        writer.write(event(10)).unwrap();
        let flushed = writer.complete_chunk().unwrap();

        assert_eq!(flushed.value(), 4096);
        assert_eq!(writer.position(), 4096);
        assert_eq!(db.manager().chunks_count(), 2);

        let next = writer.write(event(10)).unwrap();
        assert_eq!(next.log_position, 4096);
    }

    #[test]
    fn test_reopen_on_disk_continues_at_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig {
            chunk_size: 4096,
            ..DbConfig::new(dir.path())
        };
        let open = || {
            let db = ChunkDb::open(
                &config,
                CheckpointSet::open(dir.path()).unwrap(),
                Arc::new(MetricsRegistry::new()),
            )
            .unwrap();
            Arc::new(db)
        };

        let end = {
            let writer = LogWriter::open(open()).unwrap();
            writer.write(event(50)).unwrap();
            writer.write(event(50)).unwrap();
            writer.flush().unwrap().value()
        };

        let writer = LogWriter::open(open()).unwrap();
        assert_eq!(writer.position(), end);
        assert_eq!(writer.write(event(5)).unwrap().log_position, end);
    }

    #[test]
    fn test_unflushed_appends_are_lost_on_reopen() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig {
            chunk_size: 4096,
            ..DbConfig::new(dir.path())
        };
        let open = || {
            Arc::new(
                ChunkDb::open(
                    &config,
                    CheckpointSet::open(dir.path()).unwrap(),
                    Arc::new(MetricsRegistry::new()),
                )
                .unwrap(),
            )
        };

        let flushed = {
            let writer = LogWriter::open(open()).unwrap();
            writer.write(event(50)).unwrap();
            let flushed = writer.flush().unwrap().value();
            writer.write(event(50)).unwrap();
            flushed
        };

        let writer = LogWriter::open(open()).unwrap();
        assert_eq!(writer.position(), flushed);
    }
}
