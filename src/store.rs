//! The store: one writer, one log, one index.
//!
//! Writes are serialized. Each write checks the expected version against the
//! read index, appends its records, flushes the writer, then lets the chaser
//! feed the new records to the index committer before the chaser and index
//! checkpoints move to the writer's flushed position. When a write returns,
//! its events are durable and readable.
//!
//! ```text
//! append ──► LogWriter ──► flush ──► LogChaser ──► IndexCommitter ──► TableIndex
//!                                       │
//!                           chaser + index checkpoints
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, FlushedPosition};
use crate::config::DbConfig;
use crate::index::{StreamHasher, Xxh3Hasher};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, Timer};
use crate::readindex::{
    event_types, IndexCommitter, ReadEventResult, ReadIndex, ReadIndexError, StreamMetadata,
    StreamSlice, SystemStreams,
};
use crate::recovery::{recover_with_hasher, RecoveryError, RecoveryStats};
use crate::scavenge::{ScavengeError, ScavengeOptions, ScavengeService, ScavengeStatus};
use crate::tlog::chaser::LogChaser;
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::ChunkError;
use crate::tlog::reader::{LogReader, ReadTracker};
use crate::tlog::record::{
    expected_version, CommitRecord, LogRecord, PrepareFlags, PrepareRecord, SystemRecord,
    DELETED_STREAM,
};
use crate::tlog::writer::LogWriter;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Log(#[from] ChunkError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    ReadIndex(#[from] ReadIndexError),
    #[error(transparent)]
    Scavenge(#[from] ScavengeError),
    #[error("wrong expected version for stream '{stream}': expected {expected}, current {current}")]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        current: i64,
    },
    #[error("stream '{0}' is deleted")]
    StreamDeleted(String),
    #[error("invalid stream id '{0}'")]
    InvalidStream(String),
    #[error("invalid epoch record at {position}: {reason}")]
    InvalidEpoch { position: i64, reason: String },
    #[error("stream metadata could not be serialized: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Recovery(e) => e.code().code(),
            StoreError::Log(e) => e.code().code(),
            StoreError::Checkpoint(e) => e.code().code(),
            StoreError::ReadIndex(e) => e.code(),
            StoreError::Scavenge(_) => "STREAMDB_SCAVENGE_FAILED",
            StoreError::WrongExpectedVersion { .. } => "STREAMDB_WRONG_EXPECTED_VERSION",
            StoreError::StreamDeleted(_) => "STREAMDB_STREAM_DELETED",
            StoreError::InvalidStream(_) => "STREAMDB_INVALID_STREAM",
            StoreError::InvalidEpoch { .. } => "STREAMDB_INVALID_EPOCH",
            StoreError::Metadata(_) => "STREAMDB_INVALID_METADATA",
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Recovery(_) => true,
            StoreError::Log(e) => e.is_fatal(),
            StoreError::Checkpoint(e) => e.is_fatal(),
            StoreError::ReadIndex(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// An event to append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub is_json: bool,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
            is_json: false,
        }
    }

    pub fn json(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            is_json: true,
            ..Self::new(event_type, data)
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Outcome of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub first_event_number: i64,
    /// Equal to `first_event_number - 1` when nothing was written
    pub last_event_number: i64,
    /// Log position of the first record written; -1 when nothing was written
    pub log_position: i64,
}

/// Body of an epoch system record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub epoch_number: i64,
    pub epoch_id: Uuid,
    /// Log position of the epoch record, filled in after the write
    #[serde(skip)]
    pub position: i64,
}

struct WritePlan {
    next_event_number: i64,
    /// Soft-deleted stream written again: its old events stay hidden
    recreate: bool,
}

struct Ingest {
    chaser: LogChaser,
    committer: IndexCommitter,
}

pub struct Store {
    db: Arc<ChunkDb>,
    read_index: Arc<ReadIndex>,
    writer: LogWriter,
    reader: LogReader,
    ingest: Mutex<Ingest>,
    scavenges: ScavengeService,
    metrics: Arc<MetricsRegistry>,
    recovery: RecoveryStats,
}

impl Store {
    pub fn open(config: &DbConfig) -> StoreResult<Self> {
        Self::open_with_hasher(config, Arc::new(Xxh3Hasher))
    }

    /// Open with a custom stream hasher
    pub fn open_with_hasher(config: &DbConfig, hasher: Arc<dyn StreamHasher>) -> StoreResult<Self> {
        let timer = Timer::new();
        log_event_with_fields(
            Event::StoreOpenBegin,
            &[("data_dir", &config.data_dir.display().to_string())],
        );

        let recovered = recover_with_hasher(config, hasher)?;
        let db = recovered.db;
        let reader = LogReader::new(Arc::clone(&db));
        let read_index = Arc::new(ReadIndex::new(
            reader.clone(),
            Arc::clone(&recovered.index),
            config.metastream_max_count,
        ));
        let writer = LogWriter::open(Arc::clone(&db))?;
        let ingest = Ingest {
            chaser: LogChaser::new(Arc::clone(&db)),
            committer: IndexCommitter::new(recovered.index, reader.clone()),
        };
        let scavenges = ScavengeService::new(
            Arc::clone(&db),
            Arc::clone(&read_index),
            ScavengeOptions::from_config(config),
        );

        log_event_with_fields(
            Event::StoreOpenComplete,
            &[
                ("writer", &writer.position().to_string()),
                ("duration_ms", &timer.elapsed_ms()),
            ],
        );
        Ok(Self {
            db,
            read_index,
            writer,
            reader,
            ingest: Mutex::new(ingest),
            scavenges,
            metrics: recovered.metrics,
            recovery: recovered.stats,
        })
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    pub fn read_index(&self) -> &Arc<ReadIndex> {
        &self.read_index
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// Position the next record will be written at
    pub fn writer_position(&self) -> i64 {
        self.writer.position()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Append events to a stream. A single event is written as a
    /// self-committing prepare, several as an explicit transaction.
    pub fn append_to_stream(
        &self,
        stream: &str,
        expected: i64,
        events: Vec<EventData>,
    ) -> StoreResult<WriteResult> {
        if events.len() > 1 {
            return self.write_transaction(stream, expected, events);
        }
        let mut ingest = self.ingest.lock();
        let plan = self.plan_write(stream, expected)?;
        let Some(event) = events.into_iter().next() else {
            return Ok(WriteResult {
                first_event_number: plan.next_event_number,
                last_event_number: plan.next_event_number - 1,
                log_position: -1,
            });
        };
        if plan.recreate {
            self.write_recreate_metadata(stream, plan.next_event_number)?;
        }

        let mut flags = PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_COMMITTED;
        if event.is_json {
            flags |= PrepareFlags::IS_JSON;
        }
        let mut prepare = PrepareRecord::new(
            stream,
            plan.next_event_number - 1,
            event.event_type,
            event.data,
            event.metadata,
            flags,
        );
        prepare.event_id = event.event_id;
        let written = self.writer.write(LogRecord::Prepare(prepare))?;
        self.index_written(&mut ingest)?;

        Ok(WriteResult {
            first_event_number: plan.next_event_number,
            last_event_number: plan.next_event_number,
            log_position: written.log_position,
        })
    }

    /// Write `events` as one explicit transaction: one prepare per event,
    /// then a commit that assigns their event numbers.
    pub fn write_transaction(
        &self,
        stream: &str,
        expected: i64,
        events: Vec<EventData>,
    ) -> StoreResult<WriteResult> {
        let mut ingest = self.ingest.lock();
        let plan = self.plan_write(stream, expected)?;
        let first = plan.next_event_number;
        if events.is_empty() {
            return Ok(WriteResult {
                first_event_number: first,
                last_event_number: first - 1,
                log_position: -1,
            });
        }
        if plan.recreate {
            self.write_recreate_metadata(stream, first)?;
        }

        let count = events.len();
        let mut transaction_position = -1;
        for (offset, event) in events.into_iter().enumerate() {
            let mut flags = PrepareFlags::DATA;
            if offset == 0 {
                flags |= PrepareFlags::TRANSACTION_BEGIN;
            }
            if offset + 1 == count {
                flags |= PrepareFlags::TRANSACTION_END;
            }
            if event.is_json {
                flags |= PrepareFlags::IS_JSON;
            }
            let mut prepare = PrepareRecord::new(
                stream,
                first - 1,
                event.event_type,
                event.data,
                event.metadata,
                flags,
            );
            prepare.event_id = event.event_id;
            prepare.transaction_offset = offset as i32;
            if offset > 0 {
                prepare.transaction_position = transaction_position;
            }
            let written = self.writer.write(LogRecord::Prepare(prepare))?;
            if offset == 0 {
                transaction_position = written.log_position;
            }
        }
        self.writer
            .write(LogRecord::Commit(CommitRecord::new(transaction_position, first)))?;
        self.index_written(&mut ingest)?;

        Ok(WriteResult {
            first_event_number: first,
            last_event_number: first + count as i64 - 1,
            log_position: transaction_position,
        })
    }

    /// Replace the stream's metadata. `expected` applies to the metastream.
    pub fn set_stream_metadata(
        &self,
        stream: &str,
        expected: i64,
        metadata: &StreamMetadata,
    ) -> StoreResult<WriteResult> {
        if SystemStreams::is_metastream(stream) {
            return Err(StoreError::InvalidStream(stream.to_string()));
        }
        let metastream = SystemStreams::metastream_of(stream);
        self.append_to_stream(
            &metastream,
            expected,
            vec![EventData::json(event_types::STREAM_METADATA, metadata.to_json()?)],
        )
    }

    /// Delete a stream. A hard delete writes a tombstone and the stream can
    /// never be written again. A soft delete sets `$tb` to the deleted
    /// marker in the metadata; the stream reads as missing and is recreated
    /// by the next append.
    pub fn delete_stream(&self, stream: &str, expected: i64, hard: bool) -> StoreResult<WriteResult> {
        let mut ingest = self.ingest.lock();
        let plan = self.plan_write(stream, expected)?;

        if hard {
            let tombstone = PrepareRecord::new(
                stream,
                DELETED_STREAM - 1,
                event_types::STREAM_DELETED,
                Vec::new(),
                Vec::new(),
                PrepareFlags::DELETE_TOMBSTONE | PrepareFlags::IS_COMMITTED,
            );
            let written = self.writer.write(LogRecord::Prepare(tombstone))?;
            self.index_written(&mut ingest)?;
            return Ok(WriteResult {
                first_event_number: DELETED_STREAM,
                last_event_number: DELETED_STREAM,
                log_position: written.log_position,
            });
        }

        let current = self.read_index.get_stream_metadata(stream)?;
        let metadata = StreamMetadata {
            max_count: current.max_count,
            max_age: current.max_age,
            ..StreamMetadata::soft_deleted(current.is_temp_stream())
        };
        let position = self.write_metadata(stream, &metadata)?;
        self.index_written(&mut ingest)?;
        Ok(WriteResult {
            first_event_number: plan.next_event_number,
            last_event_number: plan.next_event_number - 1,
            log_position: position,
        })
    }

    /// Write the next epoch record and point the epoch checkpoint at it
    pub fn write_epoch(&self) -> StoreResult<Epoch> {
        let mut ingest = self.ingest.lock();
        let epoch_checkpoint = &self.db.checkpoints().epoch;
        let previous = match epoch_checkpoint.read() {
            position if position < 0 => None,
            position => Some(self.read_epoch(position)?),
        };

        let mut epoch = Epoch {
            epoch_number: previous.map_or(0, |e| e.epoch_number + 1),
            epoch_id: Uuid::new_v4(),
            position: -1,
        };
        let body = serde_json::to_vec(&epoch).map_err(|e| StoreError::InvalidEpoch {
            position: -1,
            reason: e.to_string(),
        })?;
        let written = self
            .writer
            .write(LogRecord::System(SystemRecord::epoch(body)))?;
        self.index_written(&mut ingest)?;

        epoch_checkpoint.write(written.log_position);
        epoch_checkpoint.flush()?;
        epoch.position = written.log_position;
        log_event_with_fields(
            Event::EpochWritten,
            &[
                ("epoch_number", &epoch.epoch_number.to_string()),
                ("epoch_id", &epoch.epoch_id.to_string()),
                ("position", &epoch.position.to_string()),
            ],
        );
        Ok(epoch)
    }

    /// The epoch the epoch checkpoint points at
    pub fn last_epoch(&self) -> StoreResult<Option<Epoch>> {
        match self.db.checkpoints().epoch.read() {
            position if position < 0 => Ok(None),
            position => self.read_epoch(position).map(Some),
        }
    }

    /// Seal the writable chunk and open the next one
    pub fn complete_chunk(&self) -> StoreResult<()> {
        let mut ingest = self.ingest.lock();
        self.writer.complete_chunk()?;
        self.index_written(&mut ingest)?;
        Ok(())
    }

    pub fn flush(&self) -> StoreResult<FlushedPosition> {
        let mut ingest = self.ingest.lock();
        self.index_written(&mut ingest)
    }

    /// Stop any running scavenge and flush
    pub fn close(self) -> StoreResult<()> {
        if self.scavenges.stop().is_ok() {
            self.scavenges.wait()?;
        }
        self.flush()?;
        log_event_with_fields(
            Event::StoreClosed,
            &[("writer", &self.writer.position().to_string())],
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read_event(&self, stream: &str, event_number: i64) -> StoreResult<ReadEventResult> {
        Ok(self.read_index.read_event(stream, event_number)?)
    }

    pub fn read_stream_forward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> StoreResult<StreamSlice> {
        Ok(self
            .read_index
            .read_stream_forward(stream, from_event_number, max_count)?)
    }

    pub fn read_stream_backward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> StoreResult<StreamSlice> {
        Ok(self
            .read_index
            .read_stream_backward(stream, from_event_number, max_count)?)
    }

    pub fn get_stream_last_event_number(&self, stream: &str) -> StoreResult<i64> {
        Ok(self.read_index.get_stream_last_event_number(stream)?)
    }

    pub fn get_stream_metadata(&self, stream: &str) -> StoreResult<StreamMetadata> {
        Ok(self.read_index.get_stream_metadata(stream)?)
    }

    // ------------------------------------------------------------------
    // Scavenging
    // ------------------------------------------------------------------

    /// Start a background scavenge with the configured options
    pub fn start_scavenge(&self) -> StoreResult<Uuid> {
        Ok(self.scavenges.start(self.scavenges.defaults())?)
    }

    pub fn start_scavenge_with(&self, options: ScavengeOptions) -> StoreResult<Uuid> {
        Ok(self.scavenges.start(options)?)
    }

    /// Run a scavenge to completion
    pub fn scavenge(&self, options: ScavengeOptions) -> StoreResult<ScavengeStatus> {
        self.scavenges.start(options)?;
        Ok(self.scavenges.wait()?)
    }

    pub fn stop_scavenge(&self) -> StoreResult<Uuid> {
        Ok(self.scavenges.stop()?)
    }

    pub fn wait_for_scavenge(&self) -> StoreResult<ScavengeStatus> {
        Ok(self.scavenges.wait()?)
    }

    pub fn scavenge_status(&self) -> Option<ScavengeStatus> {
        self.scavenges.status()
    }

    pub fn scavenge_history(&self) -> Vec<ScavengeStatus> {
        self.scavenges.history()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Check `expected` against the stream's current version. A soft-deleted
    /// stream counts as not existing.
    fn plan_write(&self, stream: &str, expected: i64) -> StoreResult<WritePlan> {
        if stream.is_empty() {
            return Err(StoreError::InvalidStream(stream.to_string()));
        }
        let last = self.read_index.get_stream_last_event_number(stream)?;
        if last == DELETED_STREAM {
            return Err(StoreError::StreamDeleted(stream.to_string()));
        }
        let soft_deleted = self.read_index.is_soft_deleted(stream)?;
        let current = if soft_deleted {
            expected_version::NO_STREAM
        } else {
            last
        };

        let matches = match expected {
            expected_version::ANY => true,
            expected_version::NO_STREAM => current == expected_version::NO_STREAM,
            expected_version::STREAM_EXISTS => current >= 0,
            n => n >= 0 && n == current,
        };
        if !matches {
            return Err(StoreError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected,
                current,
            });
        }
        Ok(WritePlan {
            next_event_number: last + 1,
            recreate: soft_deleted,
        })
    }

    /// Lift a soft delete: events before `first_event_number` stay hidden
    fn write_recreate_metadata(&self, stream: &str, first_event_number: i64) -> StoreResult<()> {
        let current = self.read_index.get_stream_metadata(stream)?;
        let metadata = StreamMetadata {
            truncate_before: Some(first_event_number),
            ..current
        };
        self.write_metadata(stream, &metadata)?;
        Ok(())
    }

    /// Append a metadata event without checking the metastream's version
    fn write_metadata(&self, stream: &str, metadata: &StreamMetadata) -> StoreResult<i64> {
        let metastream = SystemStreams::metastream_of(stream);
        let last = self.read_index.get_stream_last_event_number(&metastream)?;
        let prepare = PrepareRecord::new(
            metastream,
            last,
            event_types::STREAM_METADATA,
            metadata.to_json()?,
            Vec::new(),
            PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_COMMITTED | PrepareFlags::IS_JSON,
        );
        Ok(self.writer.write(LogRecord::Prepare(prepare))?.log_position)
    }

    /// Make the written records durable, index them and move the chaser and
    /// index checkpoints along.
    fn index_written(&self, ingest: &mut Ingest) -> StoreResult<FlushedPosition> {
        let flushed = self.writer.flush()?;
        while let Some(read) = ingest.chaser.try_read_next()? {
            ingest.committer.commit(&read.record)?;
        }
        ingest.chaser.commit(flushed)?;

        let index_checkpoint = &self.db.checkpoints().index;
        let indexed = ingest.chaser.position().min(flushed.value());
        if indexed > index_checkpoint.read() {
            index_checkpoint.advance_to(indexed, flushed)?;
        }
        Ok(flushed)
    }

    fn read_epoch(&self, position: i64) -> StoreResult<Epoch> {
        let invalid = |reason: String| StoreError::InvalidEpoch { position, reason };
        let read = self
            .reader
            .try_read_at(position, true, &ReadTracker::new("epoch"))?
            .ok_or_else(|| invalid("no record".to_string()))?;
        let kind = read.record.record_type();
        let LogRecord::System(system) = read.record else {
            return Err(invalid(format!("found a {} record", kind.as_str())));
        };
        let mut epoch: Epoch =
            serde_json::from_slice(&system.data).map_err(|e| invalid(e.to_string()))?;
        epoch.position = position;
        Ok(epoch)
    }
}
