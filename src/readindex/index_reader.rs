//! Stream reads on top of the index and the log.
//!
//! The index is keyed by stream hash, so every candidate position is read
//! back from the log and its stream id compared before it is returned.
//! Among candidates of the same event number the latest write wins.
//!
//! Stream metadata is applied on read: `$tb`, `$maxCount` and `$maxAge`
//! hide events, a soft-deleted stream reads as `NoStream` and a hard-deleted
//! stream (or its metastream) as `StreamDeleted`.

use std::sync::Arc;

use chrono::Utc;

use super::errors::ReadIndexResult;
use super::metadata::StreamMetadata;
use super::streams::SystemStreams;
use crate::index::{IndexError, TableIndex};
use crate::tlog::reader::{LogReader, ReadTracker};
use crate::tlog::record::{expected_version, LogRecord, PrepareRecord, DELETED_STREAM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

/// An event resolved through the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_number: i64,
    pub prepare: PrepareRecord,
}

impl EventRecord {
    pub fn stream(&self) -> &str {
        &self.prepare.event_stream_id
    }

    pub fn log_position(&self) -> i64 {
        self.prepare.log_position
    }

    pub fn event_type(&self) -> &str {
        &self.prepare.event_type
    }

    pub fn data(&self) -> &[u8] {
        &self.prepare.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEventResult {
    pub status: ReadStatus,
    pub record: Option<EventRecord>,
}

impl ReadEventResult {
    fn status(status: ReadStatus) -> Self {
        Self {
            status,
            record: None,
        }
    }
}

/// One page of a stream read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub status: ReadStatus,
    /// In read direction
    pub events: Vec<EventRecord>,
    /// Where the next page in the same direction starts
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

impl StreamSlice {
    fn status(status: ReadStatus, last_event_number: i64) -> Self {
        Self {
            status,
            events: Vec::new(),
            next_event_number: -1,
            last_event_number,
            is_end_of_stream: true,
        }
    }
}

/// Last event number and metadata of a readable stream
struct StreamState {
    last_event_number: i64,
    metadata: StreamMetadata,
}

pub struct ReadIndex {
    reader: LogReader,
    index: Arc<TableIndex>,
    metastream_max_count: i64,
    tracker: ReadTracker,
}

impl ReadIndex {
    pub fn new(reader: LogReader, index: Arc<TableIndex>, metastream_max_count: i64) -> Self {
        Self {
            reader,
            index,
            metastream_max_count,
            tracker: ReadTracker::new("read_index"),
        }
    }

    pub fn index(&self) -> &Arc<TableIndex> {
        &self.index
    }

    pub fn tracker(&self) -> &ReadTracker {
        &self.tracker
    }

    // ------------------------------------------------------------------
    // Reads with metadata applied
    // ------------------------------------------------------------------

    /// Read one event. `event_number == -1` reads the last event.
    pub fn read_event(&self, stream: &str, event_number: i64) -> ReadIndexResult<ReadEventResult> {
        let state = match self.stream_state(stream)? {
            Ok(state) => state,
            Err(status) => return Ok(ReadEventResult::status(status)),
        };
        let last = state.last_event_number;
        let event_number = if event_number == -1 { last } else { event_number };
        if event_number < state.metadata.first_visible_event(last) || event_number > last {
            return Ok(ReadEventResult::status(ReadStatus::NotFound));
        }
        match self.get_prepare(stream, event_number)? {
            Some(prepare) if !is_expired(&state.metadata, &prepare) => Ok(ReadEventResult {
                status: ReadStatus::Success,
                record: Some(EventRecord {
                    event_number,
                    prepare,
                }),
            }),
            _ => Ok(ReadEventResult::status(ReadStatus::NotFound)),
        }
    }

    /// Up to `max_count` events from `from_event_number` upwards
    pub fn read_stream_forward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> ReadIndexResult<StreamSlice> {
        let state = match self.stream_state(stream)? {
            Ok(state) => state,
            Err(status) => return Ok(StreamSlice::status(status, self.get_stream_last_event_number(stream)?)),
        };
        let last = state.last_event_number;
        if max_count == 0 {
            return Ok(StreamSlice {
                status: ReadStatus::Success,
                events: Vec::new(),
                next_event_number: from_event_number,
                last_event_number: last,
                is_end_of_stream: from_event_number > last,
            });
        }

        let start = from_event_number.max(state.metadata.first_visible_event(last));
        let end = from_event_number
            .saturating_add(max_count as i64 - 1)
            .min(last);
        let mut events = self.collect_range(stream, start, end, &state.metadata)?;
        events.reverse();

        let is_end_of_stream = end >= last;
        Ok(StreamSlice {
            status: ReadStatus::Success,
            events,
            next_event_number: if is_end_of_stream { last + 1 } else { end + 1 },
            last_event_number: last,
            is_end_of_stream,
        })
    }

    /// Up to `max_count` events from `from_event_number` downwards;
    /// `from_event_number == -1` starts at the end of the stream
    pub fn read_stream_backward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> ReadIndexResult<StreamSlice> {
        let state = match self.stream_state(stream)? {
            Ok(state) => state,
            Err(status) => return Ok(StreamSlice::status(status, self.get_stream_last_event_number(stream)?)),
        };
        let last = state.last_event_number;
        let first_visible = state.metadata.first_visible_event(last);
        let end = if from_event_number == -1 {
            last
        } else {
            from_event_number.min(last)
        };
        if max_count == 0 {
            return Ok(StreamSlice {
                status: ReadStatus::Success,
                events: Vec::new(),
                next_event_number: end,
                last_event_number: last,
                is_end_of_stream: end < first_visible,
            });
        }

        let start = end
            .saturating_sub(max_count as i64 - 1)
            .max(first_visible);
        let events = self.collect_range(stream, start, end, &state.metadata)?;

        let is_end_of_stream = start <= first_visible;
        Ok(StreamSlice {
            status: ReadStatus::Success,
            events,
            next_event_number: if is_end_of_stream { -1 } else { start - 1 },
            last_event_number: last,
            is_end_of_stream,
        })
    }

    // ------------------------------------------------------------------
    // Raw stream information, metadata not applied
    // ------------------------------------------------------------------

    /// Last event number, `-1` for a stream that does not exist and
    /// [`DELETED_STREAM`] for a hard-deleted stream or its metastream
    pub fn get_stream_last_event_number(&self, stream: &str) -> ReadIndexResult<i64> {
        if let Some(original) = SystemStreams::original_stream_of(stream) {
            if self.last_event_number_of(original)? == DELETED_STREAM {
                return Ok(DELETED_STREAM);
            }
        }
        self.last_event_number_of(stream)
    }

    pub fn get_stream_metadata(&self, stream: &str) -> ReadIndexResult<StreamMetadata> {
        if SystemStreams::is_metastream(stream) {
            return Ok(StreamMetadata::with_max_count(self.metastream_max_count));
        }
        let metastream = SystemStreams::metastream_of(stream);
        let last = self.last_event_number_of(&metastream)?;
        if last < 0 || last == DELETED_STREAM {
            return Ok(StreamMetadata::empty());
        }
        Ok(self
            .get_prepare(&metastream, last)?
            .map(|p| StreamMetadata::from_json(stream, &p.data))
            .unwrap_or_default())
    }

    /// Log position of `(stream, event_number)`, latest write first
    pub fn get_event_position(&self, stream: &str, event_number: i64) -> ReadIndexResult<Option<i64>> {
        Ok(self
            .get_prepare(stream, event_number)?
            .map(|p| p.log_position))
    }

    pub fn is_stream_deleted(&self, stream: &str) -> ReadIndexResult<bool> {
        Ok(self.get_stream_last_event_number(stream)? == DELETED_STREAM)
    }

    pub fn is_soft_deleted(&self, stream: &str) -> ReadIndexResult<bool> {
        Ok(self.get_stream_metadata(stream)?.is_soft_deleted())
    }

    /// Log positions of the oldest and latest index entries under the
    /// stream's hash
    pub fn stream_position_bounds(&self, stream: &str) -> Option<(i64, i64)> {
        let hash = self.index.hash(stream);
        let oldest = self.index.try_get_oldest_entry(hash)?;
        let latest = self.index.try_get_latest_entry(hash)?;
        Some((oldest.position, latest.position))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn stream_state(&self, stream: &str) -> ReadIndexResult<Result<StreamState, ReadStatus>> {
        let last = self.get_stream_last_event_number(stream)?;
        if last == DELETED_STREAM {
            return Ok(Err(ReadStatus::StreamDeleted));
        }
        if last == expected_version::NO_STREAM {
            return Ok(Err(ReadStatus::NoStream));
        }
        let metadata = self.get_stream_metadata(stream)?;
        if metadata.is_soft_deleted() {
            return Ok(Err(ReadStatus::NoStream));
        }
        Ok(Ok(StreamState {
            last_event_number: last,
            metadata,
        }))
    }

    fn last_event_number_of(&self, stream: &str) -> ReadIndexResult<i64> {
        let hash = self.index.hash(stream);
        for entry in self.index.range(hash, 0, i64::MAX) {
            if self
                .read_prepare(hash, entry.version, entry.position, stream)?
                .is_some()
            {
                return Ok(entry.version);
            }
        }
        Ok(expected_version::NO_STREAM)
    }

    fn get_prepare(&self, stream: &str, event_number: i64) -> ReadIndexResult<Option<PrepareRecord>> {
        let hash = self.index.hash(stream);
        let mut candidates = self.index.candidates(hash, event_number);
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates.dedup();
        for position in candidates {
            if let Some(prepare) = self.read_prepare(hash, event_number, position, stream)? {
                return Ok(Some(prepare));
            }
        }
        Ok(None)
    }

    /// Visible events in `start..=end`, descending
    fn collect_range(
        &self,
        stream: &str,
        start: i64,
        end: i64,
        metadata: &StreamMetadata,
    ) -> ReadIndexResult<Vec<EventRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let hash = self.index.hash(stream);
        let mut events: Vec<EventRecord> = Vec::new();
        for entry in self.index.range(hash, start, end) {
            if events.last().is_some_and(|e| e.event_number == entry.version) {
                continue;
            }
            let Some(prepare) = self.read_prepare(hash, entry.version, entry.position, stream)? else {
                continue;
            };
            if is_expired(metadata, &prepare) {
                continue;
            }
            events.push(EventRecord {
                event_number: entry.version,
                prepare,
            });
        }
        Ok(events)
    }

    /// The prepare at `position` if it belongs to `stream`. A miss inside a
    /// scavenged chunk was removed on purpose; a miss anywhere else means the
    /// index points at nothing.
    fn read_prepare(
        &self,
        hash: u64,
        version: i64,
        position: i64,
        stream: &str,
    ) -> ReadIndexResult<Option<PrepareRecord>> {
        match self.reader.try_read_at(position, true, &self.tracker)? {
            Some(found) => match found.record {
                LogRecord::Prepare(prepare) => {
                    Ok((prepare.event_stream_id == stream).then_some(prepare))
                }
                LogRecord::Commit(_)
                | LogRecord::System(_)
                | LogRecord::PartitionType(_)
                | LogRecord::StreamType(_) => {
                    Err(IndexError::dangling_entry(hash, version, position).into())
                }
            },
            None => {
                if position < self.reader.writer_position() && self.reader.is_scavenged_at(position)? {
                    Ok(None)
                } else {
                    Err(IndexError::dangling_entry(hash, version, position).into())
                }
            }
        }
    }
}

fn is_expired(metadata: &StreamMetadata, prepare: &PrepareRecord) -> bool {
    metadata.is_expired(prepare.timestamp, Utc::now())
}
