//! Rewrites one chunk (or merges a run of chunks) into a scavenged chunk.
//!
//! Survivors are appended, in log order, to a temporary chunk that keeps
//! their original log positions and records one [`PosMap`] entry each. The
//! temporary chunk is sealed and only then swapped in; until the swap the
//! original chunk is untouched and readers never see the new file. A failed
//! or cancelled rewrite deletes the temporary file.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::cancel::CancellationToken;
use super::errors::ScavengeResult;
use super::policy::{gather_commit, CommitInfos, RetentionPolicy};
use super::state::ChunkScavengeReport;
use crate::observability::{log_event_with_fields, Event, Timer};
use crate::readindex::ReadIndex;
use crate::tlog::chunk::{AppendResult, Chunk, PosMap};
use crate::tlog::db::ChunkDb;
use crate::tlog::errors::ChunkError;
use crate::tlog::record::LogRecord;

pub struct ChunkScavenger<'a> {
    db: &'a ChunkDb,
    policy: RetentionPolicy<'a>,
    always_keep_scavenged: bool,
}

impl<'a> ChunkScavenger<'a> {
    pub fn new(
        db: &'a ChunkDb,
        read_index: &'a ReadIndex,
        now: DateTime<Utc>,
        always_keep_scavenged: bool,
    ) -> Self {
        Self {
            db,
            policy: RetentionPolicy::new(read_index, now),
            always_keep_scavenged,
        }
    }

    /// Drop the records the retention policy rejects from `chunk`. The new
    /// chunk replaces the old one only if it is smaller, or always when
    /// `always_keep_scavenged` is set.
    pub fn scavenge_chunk(
        &self,
        chunk: &Arc<Chunk>,
        cancel: &CancellationToken,
    ) -> ScavengeResult<ChunkScavengeReport> {
        let timer = Timer::new();
        let start = chunk.chunk_start_position();
        let end = chunk.chunk_end_position();

        let mut commits = CommitInfos::new();
        for_each_record(chunk, |record| {
            gather_commit(&mut commits, &record, start);
            Ok(())
        })?;

        let temp = self
            .db
            .manager()
            .create_temp_chunk(chunk.chunk_start_number(), chunk.chunk_end_number())?;

        let mut kept = 0u64;
        let mut discarded = 0u64;
        let mut pos_map = Vec::new();
        let written = for_each_record(chunk, |record| {
            cancel.check()?;
            if self.policy.should_keep(&record, &mut commits, start, end)? {
                pos_map.push(append_survivor(&temp, &record, start)?);
                kept += 1;
            } else {
                discarded += 1;
            }
            Ok(())
        })
        .and_then(|()| Ok(temp.complete_scavenged(&pos_map)?));
        if let Err(e) = written {
            discard_temp(temp);
            return Err(e);
        }

        let old_size = chunk.file_size();
        let new_size = temp.file_size();
        let swap = new_size < old_size || self.always_keep_scavenged;
        let space_saved = if swap {
            self.db.manager().swap_chunk(temp)?;
            old_size - new_size
        } else {
            discard_temp(temp);
            0
        };

        let report = ChunkScavengeReport {
            chunk_start_number: chunk.chunk_start_number(),
            chunk_end_number: chunk.chunk_end_number(),
            kept,
            discarded,
            space_saved,
            swapped: swap,
            elapsed_ms: timer.elapsed_millis(),
        };
        self.db
            .metrics()
            .record_scavenged_chunk(kept, discarded, space_saved);
        log_event_with_fields(
            Event::ScavengeChunkComplete,
            &[
                ("chunk", chunk.name()),
                ("kept", &kept.to_string()),
                ("discarded", &discarded.to_string()),
                ("space_saved", &space_saved.to_string()),
                ("swapped", &swap.to_string()),
                ("duration_ms", &timer.elapsed_ms()),
            ],
        );
        Ok(report)
    }

    /// Copy every record of `chunks` (adjacent, in order) into one chunk
    /// covering their whole range and swap it in.
    pub fn merge_chunks(
        &self,
        chunks: &[Arc<Chunk>],
        cancel: &CancellationToken,
    ) -> ScavengeResult<ChunkScavengeReport> {
        let timer = Timer::new();
        let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
            return Err(ChunkError::invariant("merge of an empty chunk run").into());
        };
        let start = first.chunk_start_position();
        let temp = self
            .db
            .manager()
            .create_temp_chunk(first.chunk_start_number(), last.chunk_end_number())?;

        let mut kept = 0u64;
        let mut pos_map = Vec::new();
        let written = chunks
            .iter()
            .try_for_each(|chunk| {
                for_each_record(chunk, |record| {
                    cancel.check()?;
                    pos_map.push(append_survivor(&temp, &record, start)?);
                    kept += 1;
                    Ok(())
                })
            })
            .and_then(|()| Ok(temp.complete_scavenged(&pos_map)?));
        if let Err(e) = written {
            discard_temp(temp);
            return Err(e);
        }

        let old_size: i64 = chunks.iter().map(|c| c.file_size()).sum();
        let new_size = temp.file_size();
        let merged = self.db.manager().swap_chunk(temp)?;

        let report = ChunkScavengeReport {
            chunk_start_number: merged.chunk_start_number(),
            chunk_end_number: merged.chunk_end_number(),
            kept,
            discarded: 0,
            space_saved: old_size - new_size,
            swapped: true,
            elapsed_ms: timer.elapsed_millis(),
        };
        log_event_with_fields(
            Event::ScavengeMergeComplete,
            &[
                ("chunk", merged.name()),
                ("merged", &chunks.len().to_string()),
                ("records", &kept.to_string()),
                ("duration_ms", &timer.elapsed_ms()),
            ],
        );
        Ok(report)
    }
}

/// Visit every record of a completed chunk in log order
fn for_each_record(
    chunk: &Chunk,
    mut visit: impl FnMut(LogRecord) -> ScavengeResult<()>,
) -> ScavengeResult<()> {
    let mut local = 0;
    while let Some(found) = chunk.try_read_closest_forward(local)? {
        local = found.next_position;
        visit(found.record)?;
    }
    Ok(())
}

/// Append `record` to the temporary chunk starting at global `start`
fn append_survivor(temp: &Chunk, record: &LogRecord, start: i64) -> ScavengeResult<PosMap> {
    match temp.try_append(record)? {
        AppendResult::Written { old_position, .. } => {
            Ok(PosMap::new(record.log_position() - start, old_position))
        }
        AppendResult::Full => Err(ChunkError::invariant(format!(
            "scavenged chunk {} overflowed at log position {}",
            temp.name(),
            record.log_position()
        ))
        .into()),
    }
}

fn discard_temp(temp: Chunk) {
    temp.mark_for_deletion();
}
