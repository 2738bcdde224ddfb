//! Follows the writer and hands every durable record to the index path.
//!
//! The chaser reads from the chaser checkpoint up to the flushed writer
//! position. Its checkpoint can only be advanced with a [`FlushedPosition`],
//! so it never claims to have processed data the writer has not made durable.

use std::sync::Arc;

use crate::checkpoint::{DependentCheckpoint, FlushedPosition};
use crate::crash_point::{maybe_crash, points};
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::ChunkResult;
use crate::tlog::reader::{ReadTracker, SeqReadResult, SeqReader};

pub struct LogChaser {
    reader: SeqReader,
    checkpoint: DependentCheckpoint,
    tracker: ReadTracker,
}

impl LogChaser {
    pub fn new(db: Arc<ChunkDb>) -> Self {
        let checkpoint = db.checkpoints().chaser.clone();
        let reader = SeqReader::new(db, checkpoint.read());
        Self {
            reader,
            checkpoint,
            tracker: ReadTracker::new("chaser"),
        }
    }

    /// Position of the next record to chase
    pub fn position(&self) -> i64 {
        self.reader.position()
    }

    pub fn try_read_next(&mut self) -> ChunkResult<Option<SeqReadResult>> {
        self.reader.try_read_next(&self.tracker)
    }

    /// Persist the chaser position, bounded by the flushed writer position.
    pub fn commit(&self, flushed: FlushedPosition) -> ChunkResult<()> {
        maybe_crash(points::CHASER_BEFORE_CHECKPOINT);
        let position = self.reader.position().min(flushed.value());
        if position > self.checkpoint.read() {
            self.checkpoint.advance_to(position, flushed)?;
        }
        Ok(())
    }

    pub fn tracker(&self) -> &ReadTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::config::DbConfig;
    use crate::observability::MetricsRegistry;
    use crate::tlog::record::{LogRecord, PrepareRecord};
    use crate::tlog::writer::LogWriter;

    #[test]
    fn test_chaser_follows_flushed_writer() {
        let db = Arc::new(
            ChunkDb::open(
                &DbConfig::in_memory(4096),
                CheckpointSet::in_memory(),
                Arc::new(MetricsRegistry::new()),
            )
            .unwrap(),
        );
        let writer = LogWriter::open(Arc::clone(&db)).unwrap();
        let mut chaser = LogChaser::new(Arc::clone(&db));

        for n in 0..3 {
            writer
                .write(LogRecord::Prepare(PrepareRecord::single_write("s", n - 1, "e", vec![1])))
                .unwrap();
        }
        assert!(chaser.try_read_next().unwrap().is_none());

        let flushed = writer.flush().unwrap();
        let mut seen = 0;
        while chaser.try_read_next().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 3);

        chaser.commit(flushed).unwrap();
        assert_eq!(db.checkpoints().chaser.read(), flushed.value());
        assert_eq!(chaser.tracker().records_read(), 3);
    }
}
