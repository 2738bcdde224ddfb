//! Which records of a chunk survive a scavenge.
//!
//! Commits, system records and stream/partition type records are structural
//! and survive unless every prepare of their transaction was dropped.
//! A prepare is judged against the stream's state as the read index sees it
//! now, checked in this order:
//!
//! 1. a delete tombstone is kept
//! 2. the start of a transaction whose commit is not in this chunk is kept
//! 3. every event of a hard-deleted stream is dropped
//! 4. other prepares not known to be committed are kept
//! 5. prepares without data are dropped
//! 6. events of a soft-deleted temporary stream whose whole history is in
//!    this chunk are dropped
//! 7. an older copy of an event that was written again is dropped
//! 8. the last event of a stream is kept unless the stream is soft deleted
//! 9. events hidden by `$maxCount`, `$tb` or `$maxAge` are dropped; when
//!    several apply, the most restrictive wins
//! 10. everything else is kept

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::readindex::{ReadIndex, ReadIndexResult, SystemStreams};
use crate::tlog::record::{CommitRecord, LogRecord, PrepareFlags, PrepareRecord, DELETED_STREAM};

/// What the chunk tells about one transaction's commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub first_event_number: i64,
    /// `Some(true)` once a prepare of the transaction is kept, `Some(false)`
    /// once one was dropped and none kept
    pub keep_commit: Option<bool>,
}

impl CommitInfo {
    pub fn new(first_event_number: i64) -> Self {
        Self {
            first_event_number,
            keep_commit: None,
        }
    }

    fn forcibly_keep(&mut self) {
        self.keep_commit = Some(true);
    }

    fn try_not_to_keep(&mut self) {
        if self.keep_commit.is_none() {
            self.keep_commit = Some(false);
        }
    }
}

/// Commits found in a chunk, by transaction position
pub type CommitInfos = HashMap<i64, CommitInfo>;

/// Collect the commits of transactions that start in this chunk
pub fn gather_commit(commits: &mut CommitInfos, record: &LogRecord, chunk_start: i64) {
    if let LogRecord::Commit(commit) = record {
        if commit.transaction_position >= chunk_start {
            commits.insert(
                commit.transaction_position,
                CommitInfo::new(commit.first_event_number),
            );
        }
    }
}

pub struct RetentionPolicy<'a> {
    read_index: &'a ReadIndex,
    now: DateTime<Utc>,
}

impl<'a> RetentionPolicy<'a> {
    pub fn new(read_index: &'a ReadIndex, now: DateTime<Utc>) -> Self {
        Self { read_index, now }
    }

    /// Whether `record` of the chunk `[chunk_start, chunk_end)` survives
    pub fn should_keep(
        &self,
        record: &LogRecord,
        commits: &mut CommitInfos,
        chunk_start: i64,
        chunk_end: i64,
    ) -> ReadIndexResult<bool> {
        match record {
            LogRecord::Prepare(prepare) => {
                self.should_keep_prepare(prepare, commits, chunk_start, chunk_end)
            }
            LogRecord::Commit(commit) => Ok(Self::should_keep_commit(commit, commits)),
            LogRecord::System(_) | LogRecord::PartitionType(_) | LogRecord::StreamType(_) => {
                Ok(true)
            }
        }
    }

    pub fn should_keep_commit(commit: &CommitRecord, commits: &CommitInfos) -> bool {
        commits
            .get(&commit.transaction_position)
            .map_or(true, |info| info.keep_commit != Some(false))
    }

    pub fn should_keep_prepare(
        &self,
        prepare: &PrepareRecord,
        commits: &mut CommitInfos,
        chunk_start: i64,
        chunk_end: i64,
    ) -> ReadIndexResult<bool> {
        let commit = commits.get_mut(&prepare.transaction_position);

        if prepare.flags.contains(PrepareFlags::STREAM_DELETE) {
            if let Some(info) = commit {
                info.forcibly_keep();
            }
            return Ok(true);
        }

        let is_committed = commit.is_some() || prepare.is_committed();
        if !is_committed && prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN) {
            return Ok(true);
        }

        let stream = prepare.event_stream_id.as_str();
        let last_event_number = self.read_index.get_stream_last_event_number(stream)?;
        if last_event_number == DELETED_STREAM {
            return Ok(discard(commit));
        }

        if !is_committed {
            return Ok(true);
        }

        if !prepare.flags.contains(PrepareFlags::DATA) {
            return Ok(discard(commit));
        }

        if self.is_soft_deleted_temp_stream_within(stream, chunk_start, chunk_end)? {
            return Ok(discard(commit));
        }

        let event_number = if prepare.is_committed() {
            prepare.expected_version.saturating_add(1)
        } else {
            match &commit {
                Some(info) => info
                    .first_event_number
                    .saturating_add(prepare.transaction_offset as i64),
                None => return Ok(true),
            }
        };

        if let Some(position) = self.read_index.get_event_position(stream, event_number)? {
            if position != prepare.log_position {
                return Ok(discard(commit));
            }
        }

        let metadata = self.read_index.get_stream_metadata(stream)?;
        if event_number >= last_event_number && !metadata.is_soft_deleted() {
            return Ok(keep(commit));
        }

        let past_max_count = metadata.is_past_max_count(event_number, last_event_number);
        let truncated = metadata.truncate_before.is_some_and(|tb| event_number < tb);
        let expired = metadata.is_expired(prepare.timestamp, self.now);

        if past_max_count || truncated || expired {
            Ok(discard(commit))
        } else {
            Ok(keep(commit))
        }
    }

    /// A soft-deleted temporary stream whose events and metadata all sit in
    /// `[chunk_start, chunk_end)` can be dropped as a whole
    fn is_soft_deleted_temp_stream_within(
        &self,
        stream: &str,
        chunk_start: i64,
        chunk_end: i64,
    ) -> ReadIndexResult<bool> {
        let (original, metastream) = match SystemStreams::original_stream_of(stream) {
            Some(original) => (original.to_string(), stream.to_string()),
            None => (stream.to_string(), SystemStreams::metastream_of(stream)),
        };
        let within = |bounds: Option<(i64, i64)>| {
            bounds.is_some_and(|(oldest, latest)| {
                oldest >= chunk_start && oldest < chunk_end && latest >= chunk_start && latest < chunk_end
            })
        };
        if !within(self.read_index.stream_position_bounds(&original))
            || !within(self.read_index.stream_position_bounds(&metastream))
        {
            return Ok(false);
        }
        let metadata = self.read_index.get_stream_metadata(&original)?;
        Ok(metadata.is_soft_deleted() && metadata.is_temp_stream())
    }
}

fn keep(commit: Option<&mut CommitInfo>) -> bool {
    if let Some(info) = commit {
        info.forcibly_keep();
    }
    true
}

fn discard(commit: Option<&mut CommitInfo>) -> bool {
    if let Some(info) = commit {
        info.try_not_to_keep();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_info_keep_wins() {
        let mut info = CommitInfo::new(0);
        info.try_not_to_keep();
        assert_eq!(info.keep_commit, Some(false));
        info.forcibly_keep();
        info.try_not_to_keep();
        assert_eq!(info.keep_commit, Some(true));
    }

    #[test]
    fn test_commit_kept_unless_transaction_dropped() {
        let mut commits = CommitInfos::new();
        let mut commit = CommitRecord::new(100, 0);
        commit.log_position = 300;
        assert!(RetentionPolicy::should_keep_commit(&commit, &commits));

        gather_commit(&mut commits, &LogRecord::Commit(commit.clone()), 0);
        assert!(RetentionPolicy::should_keep_commit(&commit, &commits));
        if let Some(info) = commits.get_mut(&100) {
            info.try_not_to_keep();
        }
        assert!(!RetentionPolicy::should_keep_commit(&commit, &commits));
    }

    #[test]
    fn test_commits_of_earlier_chunks_are_not_gathered() {
        let mut commits = CommitInfos::new();
        gather_commit(&mut commits, &LogRecord::Commit(CommitRecord::new(10, 0)), 4096);
        assert!(commits.is_empty());
    }
}
