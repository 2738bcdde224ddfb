//! Turns committed log records into index entries.
//!
//! A prepare flagged `IS_COMMITTED` carries its own commit and is indexed
//! when it is read. Prepares of an explicit transaction are indexed when
//! their `Commit` record is read: the committer scans forward from the
//! commit's transaction position and numbers every data prepare of that
//! transaction from the commit's first event number.

use std::sync::Arc;

use super::errors::ReadIndexResult;
use crate::index::{IndexEntry, TableIndex};
use crate::tlog::reader::{LogReader, ReadTracker};
use crate::tlog::record::{CommitRecord, LogRecord, PrepareFlags, PrepareRecord, DELETED_STREAM};

pub struct IndexCommitter {
    index: Arc<TableIndex>,
    reader: LogReader,
    tracker: ReadTracker,
}

impl IndexCommitter {
    pub fn new(index: Arc<TableIndex>, reader: LogReader) -> Self {
        Self {
            index,
            reader,
            tracker: ReadTracker::new("index_committer"),
        }
    }

    /// Index one record. Records at or below the index's last commit
    /// position were indexed before and are skipped. Returns the number of
    /// entries added.
    pub fn commit(&self, record: &LogRecord) -> ReadIndexResult<usize> {
        let position = record.log_position();
        if position <= self.index.last_commit_position() {
            return Ok(0);
        }
        match record {
            LogRecord::Prepare(prepare) => {
                if !prepare.is_committed() || !is_indexable(prepare) {
                    return Ok(0);
                }
                let event_number = if prepare.is_tombstone() {
                    DELETED_STREAM
                } else {
                    prepare.expected_version.saturating_add(1)
                };
                self.index
                    .add(position, &prepare.event_stream_id, event_number, position)?;
                Ok(1)
            }
            LogRecord::Commit(commit) => {
                let entries = self.transaction_entries(commit)?;
                self.index.add_entries(position, &entries)?;
                Ok(entries.len())
            }
            LogRecord::System(_) | LogRecord::PartitionType(_) | LogRecord::StreamType(_) => Ok(0),
        }
    }

    fn transaction_entries(&self, commit: &CommitRecord) -> ReadIndexResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut reader = self.reader.seq_reader(commit.transaction_position);
        while let Some(read) = reader.try_read_next(&self.tracker)? {
            if read.record_pre_position >= commit.log_position {
                break;
            }
            let LogRecord::Prepare(prepare) = &read.record else {
                continue;
            };
            if prepare.transaction_position != commit.transaction_position || !is_indexable(prepare) {
                continue;
            }
            let event_number = if prepare.is_tombstone() {
                DELETED_STREAM
            } else {
                commit
                    .first_event_number
                    .saturating_add(prepare.transaction_offset as i64)
            };
            entries.push(IndexEntry::new(
                self.index.hash(&prepare.event_stream_id),
                event_number,
                prepare.log_position,
            ));
        }
        Ok(entries)
    }

    pub fn tracker(&self) -> &ReadTracker {
        &self.tracker
    }
}

fn is_indexable(prepare: &PrepareRecord) -> bool {
    prepare
        .flags
        .intersects(PrepareFlags::DATA | PrepareFlags::STREAM_DELETE)
}
