//! Startup sequence
//!
//! # Startup Sequence (strict order)
//!
//! 1. Validate the configuration
//! 2. Open the checkpoints and check that every dependent checkpoint trails
//!    the writer checkpoint
//! 3. Open the chunk database (validates chunk files against the writer
//!    checkpoint and removes scavenge leftovers)
//! 4. Open the table index
//! 5. Re-index the log from the index commit checkpoint up to the writer
//!    checkpoint
//! 6. Advance the chaser and index checkpoints to the writer checkpoint
//!
//! Any failure is fatal; the store does not open on a partial recovery.

use std::fs;
use std::sync::Arc;

use super::errors::{RecoveryError, RecoveryResult};
use crate::checkpoint::{CheckpointSet, DependentCheckpoint, FlushedPosition};
use crate::config::DbConfig;
use crate::index::{StreamHasher, TableIndex, TableIndexOptions, Xxh3Hasher};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, Timer};
use crate::readindex::IndexCommitter;
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::ChunkError;
use crate::tlog::reader::{LogReader, ReadTracker};

/// What recovery found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub writer_checkpoint: i64,
    /// Chaser checkpoint as found on disk
    pub chaser_checkpoint: i64,
    /// Index commit checkpoint as found on disk; -1 for an empty index
    pub index_checkpoint: i64,
    pub records_replayed: u64,
    pub entries_indexed: u64,
}

/// Opened and consistent log and index
pub struct Recovered {
    pub db: Arc<ChunkDb>,
    pub index: Arc<TableIndex>,
    pub metrics: Arc<MetricsRegistry>,
    pub stats: RecoveryStats,
}

/// Run the startup sequence with the default stream hasher
pub fn recover(config: &DbConfig) -> RecoveryResult<Recovered> {
    recover_with_hasher(config, Arc::new(Xxh3Hasher))
}

pub fn recover_with_hasher(
    config: &DbConfig,
    hasher: Arc<dyn StreamHasher>,
) -> RecoveryResult<Recovered> {
    let timer = Timer::new();
    log_event_with_fields(
        Event::RecoveryStart,
        &[
            ("data_dir", &config.data_dir.display().to_string()),
            ("in_memory", &config.in_memory.to_string()),
        ],
    );

    match run(config, hasher) {
        Ok(recovered) => {
            let stats = recovered.stats;
            log_event_with_fields(
                Event::RecoveryComplete,
                &[
                    ("writer", &stats.writer_checkpoint.to_string()),
                    ("records_replayed", &stats.records_replayed.to_string()),
                    ("entries_indexed", &stats.entries_indexed.to_string()),
                    ("duration_ms", &timer.elapsed_ms()),
                ],
            );
            Ok(recovered)
        }
        Err(e) => {
            log_event_with_fields(
                Event::RecoveryFailed,
                &[
                    ("code", e.code().code()),
                    ("cause", e.cause_code().unwrap_or("")),
                    ("error", e.message()),
                ],
            );
            Err(e)
        }
    }
}

fn run(config: &DbConfig, hasher: Arc<dyn StreamHasher>) -> RecoveryResult<Recovered> {
    config.validate().map_err(RecoveryError::config_invalid)?;

    let checkpoints = open_checkpoints(config)?;
    checkpoints
        .validate()
        .map_err(RecoveryError::checkpoint_failed)?;
    let chaser_checkpoint = checkpoints.chaser.read();

    let metrics = Arc::new(MetricsRegistry::new());
    let db = Arc::new(
        ChunkDb::open(config, checkpoints, Arc::clone(&metrics))
            .map_err(RecoveryError::log_failed)?,
    );
    let writer_checkpoint = db.checkpoints().writer.read();
    log_event_with_fields(
        Event::RecoveryChunksValidated,
        &[
            ("chunks", &db.manager().chunks_count().to_string()),
            ("writer", &writer_checkpoint.to_string()),
        ],
    );

    let index_dir = config.index_dir();
    let index = Arc::new(
        TableIndex::open(
            (!config.in_memory).then_some(index_dir.as_path()),
            hasher,
            TableIndexOptions::from_config(config),
            Arc::clone(&metrics),
        )
        .map_err(RecoveryError::index_failed)?,
    );
    let index_checkpoint = index.commit_checkpoint();
    if index_checkpoint > writer_checkpoint {
        return Err(RecoveryError::index_ahead_of_log(
            index_checkpoint,
            writer_checkpoint,
        ));
    }

    let (records_replayed, entries_indexed) = reindex(&db, &index, index_checkpoint.max(0))?;

    let flushed = db.checkpoints().writer.flushed_position();
    let checkpoints = db.checkpoints();
    catch_up(&checkpoints.chaser, flushed)?;
    catch_up(&checkpoints.index, flushed)?;

    Ok(Recovered {
        db,
        index,
        metrics,
        stats: RecoveryStats {
            writer_checkpoint,
            chaser_checkpoint,
            index_checkpoint,
            records_replayed,
            entries_indexed,
        },
    })
}

fn open_checkpoints(config: &DbConfig) -> RecoveryResult<CheckpointSet> {
    if config.in_memory {
        return Ok(CheckpointSet::in_memory());
    }
    fs::create_dir_all(&config.data_dir).map_err(|e| {
        RecoveryError::log_failed(ChunkError::io_failed(
            format!(
                "Failed to create data directory: {}",
                config.data_dir.display()
            ),
            e,
        ))
    })?;
    CheckpointSet::open(&config.data_dir).map_err(RecoveryError::checkpoint_failed)
}

/// Feed every durable record from `from` on to the index committer.
/// Records the index already covers are skipped by the committer.
fn reindex(db: &Arc<ChunkDb>, index: &Arc<TableIndex>, from: i64) -> RecoveryResult<(u64, u64)> {
    log_event_with_fields(
        Event::RecoveryReindexBegin,
        &[
            ("from", &from.to_string()),
            ("to", &db.checkpoints().writer.read().to_string()),
        ],
    );
    let timer = Timer::new();
    let reader = LogReader::new(Arc::clone(db));
    let committer = IndexCommitter::new(Arc::clone(index), reader.clone());
    let tracker = ReadTracker::new("recovery");
    let mut seq = reader.seq_reader(from);

    let mut records = 0u64;
    let mut entries = 0u64;
    loop {
        let position = seq.position();
        let next = seq
            .try_read_next(&tracker)
            .map_err(|e| RecoveryError::reindex_failed(position, e.into()))?;
        let Some(read) = next else {
            break;
        };
        records += 1;
        entries += committer
            .commit(&read.record)
            .map_err(|e| RecoveryError::reindex_failed(read.record_pre_position, e))?
            as u64;
    }

    log_event_with_fields(
        Event::RecoveryReindexComplete,
        &[
            ("records", &records.to_string()),
            ("entries", &entries.to_string()),
            ("duration_ms", &timer.elapsed_ms()),
        ],
    );
    Ok((records, entries))
}

fn catch_up(checkpoint: &DependentCheckpoint, flushed: FlushedPosition) -> RecoveryResult<()> {
    if checkpoint.read() < flushed.value() {
        checkpoint
            .advance_to(flushed.value(), flushed)
            .map_err(RecoveryError::checkpoint_failed)?;
    }
    Ok(())
}
