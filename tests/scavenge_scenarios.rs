//! Scavenge Scenario Tests
//!
//! End-to-end scavenges through the store on disk:
//! - Retention rules: metastream max count, `$maxCount`, `$tb`, soft and
//!   hard deletes, transactions
//! - Swapped chunks keep every surviving record at its log position
//! - A second run over a scavenged log changes nothing
//! - A failed or cancelled run never reaches the index phase
//! - Adjacent scavenged chunks merge into one
//! - The service refuses to stop a run that does not exist

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use streamdb::readindex::{ReadStatus, StreamMetadata};
use streamdb::scavenge::{
    CancellationToken, ChunkScavengeReport, ScavengeError, ScavengeOptions, ScavengeState,
    ScavengeStatus, Scavenger,
};
use streamdb::tlog::chunk::HEADER_SIZE;
use streamdb::tlog::record::{expected_version, DELETED_STREAM};
use streamdb::tlog::{LogReader, ReadTracker};
use streamdb::{DbConfig, EventData, Store, StoreError};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Small chunks, and a memtable small enough that almost every entry lands
/// in a table the index phase can scavenge
fn config(dir: &TempDir) -> DbConfig {
    let mut config = DbConfig::new(dir.path());
    config.chunk_size = 4096;
    config.max_mem_table_size = 2;
    config.metastream_max_count = 3;
    config
}

fn open(dir: &TempDir) -> Store {
    Store::open(&config(dir)).expect("open store")
}

fn options() -> ScavengeOptions {
    ScavengeOptions {
        merge_chunks: false,
        ..ScavengeOptions::default()
    }
}

fn append(store: &Store, stream: &str, expected: i64, size: usize) -> i64 {
    store
        .append_to_stream(stream, expected, vec![EventData::new("e", vec![b'x'; size])])
        .unwrap()
        .log_position
}

fn set_metadata(store: &Store, stream: &str, metadata: &StreamMetadata) -> i64 {
    store
        .set_stream_metadata(stream, expected_version::ANY, metadata)
        .unwrap()
        .log_position
}

fn event_numbers(store: &Store, stream: &str) -> Vec<i64> {
    store
        .read_stream_forward(stream, 0, 1000)
        .unwrap()
        .events
        .iter()
        .map(|e| e.event_number)
        .collect()
}

fn report_for(status: &ScavengeStatus, chunk: i32) -> &ChunkScavengeReport {
    status
        .chunks
        .iter()
        .find(|r| r.chunk_start_number == chunk)
        .unwrap_or_else(|| panic!("no report for chunk {}", chunk))
}

fn chunk_file_names(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("chunk-"))
        .collect();
    names.sort();
    names
}

/// Six metadata events for "s" and one event of "s", sealed in chunk 0.
/// Returns the log positions in write order.
fn write_metastream_overflow(store: &Store) -> Vec<i64> {
    let mut positions = Vec::new();
    for i in 0..6 {
        positions.push(set_metadata(store, "s", &StreamMetadata::with_max_count(100 + i)));
    }
    positions.push(append(store, "s", expected_version::NO_STREAM, 50));
    store.complete_chunk().unwrap();
    positions
}

// =============================================================================
// Retention Rules
// =============================================================================

/// With a metastream max count of 3, the three oldest of six metadata
/// events are dropped from the chunk and from the index.
#[test]
fn test_metastream_max_count_drops_old_metadata() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_metastream_overflow(&store);

    let status = store.scavenge(options()).unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(status.total_chunks, 1);

    let report = report_for(&status, 0);
    assert_eq!((report.kept, report.discarded), (4, 3));
    assert!(report.swapped);
    assert!(report.space_saved > 0);
    assert!(store.db().manager().get_chunk(0).unwrap().is_scavenged());

    let index = store.read_index().index();
    for version in 0..3 {
        assert!(index.get_one("$$s", version).is_none(), "$$s {} still indexed", version);
    }
    assert!(index.get_one("$$s", 5).is_some());
    assert!(status.index_result.unwrap().entries_removed >= 3);

    assert_eq!(event_numbers(&store, "$$s"), vec![3, 4, 5]);
    assert_eq!(store.get_stream_metadata("s").unwrap().max_count, Some(105));
    assert_eq!(event_numbers(&store, "s"), vec![0]);
}

/// Every surviving record reads back at its original log position through
/// the position map; dropped ones are gone.
#[test]
fn test_survivors_keep_their_log_positions() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    let positions = write_metastream_overflow(&store);
    store.scavenge(options()).unwrap();

    let reader = LogReader::new(Arc::clone(store.db()));
    let tracker = ReadTracker::new("test");
    for (i, &position) in positions.iter().enumerate() {
        let survives = i >= 3;
        assert_eq!(reader.exists_at(position, &tracker).unwrap(), survives);
        let read = reader.try_read_at(position, true, &tracker).unwrap();
        match read {
            Some(read) => {
                assert!(survives);
                assert_eq!(read.record.log_position(), position);
            }
            None => assert!(!survives),
        }
    }

    // a forward walk sees exactly the survivors
    let mut seq = reader.seq_reader(0);
    let mut walked = Vec::new();
    while let Some(read) = seq.try_read_next(&tracker).unwrap() {
        walked.push(read.record_pre_position);
    }
    assert_eq!(walked, positions[3..].to_vec());
}

/// `$maxCount` and `$tb` hide old events from reads; scavenge drops them.
#[test]
fn test_max_count_and_truncate_before() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    set_metadata(&store, "mc", &StreamMetadata::with_max_count(2));
    set_metadata(
        &store,
        "tb",
        &StreamMetadata {
            truncate_before: Some(3),
            ..StreamMetadata::default()
        },
    );
    for i in 0..5 {
        append(&store, "mc", i - 1, 100);
        append(&store, "tb", i - 1, 100);
    }
    store.complete_chunk().unwrap();

    assert_eq!(event_numbers(&store, "mc"), vec![3, 4]);
    assert_eq!(event_numbers(&store, "tb"), vec![3, 4]);

    let status = store.scavenge(options()).unwrap();
    let report = report_for(&status, 0);
    assert_eq!((report.kept, report.discarded), (6, 6));

    assert_eq!(event_numbers(&store, "mc"), vec![3, 4]);
    assert_eq!(event_numbers(&store, "tb"), vec![3, 4]);
    assert_eq!(store.get_stream_last_event_number("mc").unwrap(), 4);
}

/// A hard delete drops every event of the stream but keeps the tombstone,
/// so the stream stays deleted.
#[test]
fn test_hard_delete_keeps_tombstone() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    for i in 0..3 {
        append(&store, "s", i - 1, 100);
    }
    append(&store, "other", expected_version::NO_STREAM, 100);
    store.delete_stream("s", 2, true).unwrap();
    store.complete_chunk().unwrap();

    let status = store.scavenge(options()).unwrap();
    let report = report_for(&status, 0);
    assert_eq!((report.kept, report.discarded), (2, 3));

    assert_eq!(
        store.get_stream_last_event_number("s").unwrap(),
        DELETED_STREAM
    );
    assert_eq!(
        store.read_event("s", 0).unwrap().status,
        ReadStatus::StreamDeleted
    );
    let err = store
        .append_to_stream("s", expected_version::ANY, vec![EventData::new("e", "x")])
        .unwrap_err();
    assert!(matches!(err, StoreError::StreamDeleted(_)));
    assert_eq!(event_numbers(&store, "other"), vec![0]);
}

/// A soft delete whose metadata sits in the writable chunk: the completed
/// chunk loses the stream's events, the writable chunk is not touched and
/// other streams keep theirs.
#[test]
fn test_soft_delete_across_chunks() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    for i in 0..3 {
        append(&store, "s", i - 1, 200);
    }
    append(&store, "keep", expected_version::NO_STREAM, 200);
    store.complete_chunk().unwrap();
    store.delete_stream("s", 2, false).unwrap();

    let status = store.scavenge(options()).unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(status.total_chunks, 1);
    let report = report_for(&status, 0);
    assert_eq!((report.kept, report.discarded), (1, 3));

    let active = store.db().manager().get_chunk(1).unwrap();
    assert!(!active.is_scavenged());
    assert!(!active.is_completed());
    assert!(store.get_stream_metadata("s").unwrap().is_soft_deleted());
    assert!(event_numbers(&store, "s").is_empty());
    assert_eq!(event_numbers(&store, "keep"), vec![0]);

    // recreating shows only the new event
    let result = store
        .append_to_stream("s", expected_version::NO_STREAM, vec![EventData::new("e", "new")])
        .unwrap();
    assert_eq!(event_numbers(&store, "s"), vec![result.first_event_number]);
}

/// A soft-deleted stream whose events span two completed chunks loses all of
/// them, including the last one.
#[test]
fn test_soft_delete_spanning_two_chunks() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    for i in 0..3 {
        append(&store, "s", i - 1, 200);
    }
    store.complete_chunk().unwrap();
    for i in 3..5 {
        append(&store, "s", i - 1, 200);
    }
    append(&store, "keep", expected_version::NO_STREAM, 200);
    store.complete_chunk().unwrap();
    store.delete_stream("s", 4, false).unwrap();

    let status = store.scavenge(options()).unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(status.total_chunks, 2);
    let first = report_for(&status, 0);
    assert_eq!((first.kept, first.discarded), (0, 3));
    let second = report_for(&status, 1);
    assert_eq!((second.kept, second.discarded), (1, 2));

    assert!(event_numbers(&store, "s").is_empty());
    assert_eq!(event_numbers(&store, "keep"), vec![0]);
    assert!(!store.db().manager().get_chunk(2).unwrap().is_completed());
}

/// Out-of-range `$maxCount` and `$maxAge` values neither hide events nor
/// break reads and scavenges.
#[test]
fn test_extreme_metadata_values() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    set_metadata(
        &store,
        "count",
        &StreamMetadata {
            max_count: Some(i64::MIN),
            ..StreamMetadata::default()
        },
    );
    set_metadata(
        &store,
        "age",
        &StreamMetadata {
            max_age: Some(9_000_000_000_000),
            ..StreamMetadata::default()
        },
    );
    set_metadata(
        &store,
        "max",
        &StreamMetadata {
            max_age: Some(i64::MAX),
            max_count: Some(i64::MAX),
            ..StreamMetadata::default()
        },
    );
    for stream in ["count", "age", "max"] {
        for i in 0..3 {
            append(&store, stream, i - 1, 100);
        }
    }
    store.complete_chunk().unwrap();

    assert_eq!(store.get_stream_metadata("count").unwrap().max_count, None);
    for stream in ["count", "age", "max"] {
        assert_eq!(event_numbers(&store, stream), vec![0, 1, 2], "stream {}", stream);
        let backward = store.read_stream_backward(stream, -1, 10).unwrap();
        assert_eq!(backward.events.len(), 3);
    }

    let status = store.scavenge(options()).unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(report_for(&status, 0).discarded, 0);
    for stream in ["count", "age", "max"] {
        assert_eq!(event_numbers(&store, stream), vec![0, 1, 2], "stream {}", stream);
    }
}

/// Prepares of a transaction on a hard-deleted stream go, and so does its
/// commit; a live transaction keeps prepares and commit.
#[test]
fn test_transaction_commit_dropped_with_its_prepares() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    let events = |n: usize| -> Vec<EventData> {
        (0..n).map(|i| EventData::new("e", vec![i as u8; 100])).collect()
    };
    store
        .append_to_stream("t", expected_version::NO_STREAM, events(3))
        .unwrap();
    store
        .append_to_stream("live", expected_version::NO_STREAM, events(2))
        .unwrap();
    store.delete_stream("t", 2, true).unwrap();
    store.complete_chunk().unwrap();

    let status = store.scavenge(options()).unwrap();
    let report = report_for(&status, 0);
    // t: three prepares and the commit; live: nothing; tombstone kept
    assert_eq!((report.kept, report.discarded), (4, 4));

    let live = store.read_stream_forward("live", 0, 10).unwrap();
    assert_eq!(live.events.len(), 2);
    assert_eq!(live.events[1].data(), &[1u8; 100][..]);
}

// =============================================================================
// Swapping and Idempotence
// =============================================================================

/// A second scavenge over an already scavenged log swaps nothing and leaves
/// the same files behind.
#[test]
fn test_second_run_changes_nothing() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_metastream_overflow(&store);
    store.scavenge(options()).unwrap();
    let files = chunk_file_names(&dir);

    let second = store.scavenge(options()).unwrap();
    assert_eq!(second.state, ScavengeState::Completed);
    assert!(second.chunks.iter().all(|r| !r.swapped && r.discarded == 0));
    assert_eq!(second.space_saved, 0);
    assert_eq!(chunk_file_names(&dir), files);
    assert_eq!(event_numbers(&store, "$$s"), vec![3, 4, 5]);
}

/// Without anything to drop the original chunk stays, unless scavenged
/// chunks are always kept.
#[test]
fn test_always_keep_scavenged() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    for stream in ["a", "b", "c"] {
        append(&store, stream, expected_version::NO_STREAM, 100);
    }
    store.complete_chunk().unwrap();

    let status = store.scavenge(options()).unwrap();
    assert!(!report_for(&status, 0).swapped);
    assert!(!store.db().manager().get_chunk(0).unwrap().is_scavenged());

    let status = store
        .scavenge(ScavengeOptions {
            always_keep_scavenged: true,
            ..options()
        })
        .unwrap();
    let report = report_for(&status, 0);
    assert!(report.swapped);
    assert!(store.db().manager().get_chunk(0).unwrap().is_scavenged());
    assert_eq!(event_numbers(&store, "b"), vec![0]);
}

/// Fills chunks 0..=2 with events of "m" that a max count of one hides,
/// and leaves the last event in chunk 3.
fn write_mostly_hidden(store: &Store) {
    set_metadata(store, "m", &StreamMetadata::with_max_count(1));
    let mut expected = expected_version::NO_STREAM;
    for _ in 0..3 {
        for _ in 0..5 {
            append(store, "m", expected, 500);
            expected += 1;
        }
        store.complete_chunk().unwrap();
    }
    append(store, "m", expected, 500);
}

/// Scavenged chunks that fit together are merged into one.
#[test]
fn test_merge_scavenged_chunks() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_mostly_hidden(&store);

    let status = store
        .scavenge(ScavengeOptions {
            merge_chunks: true,
            ..ScavengeOptions::default()
        })
        .unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(status.chunks.len(), 3);
    assert!(status.chunks.iter().all(|r| r.swapped));
    assert_eq!(status.merges.len(), 1);
    assert_eq!(status.merges[0].chunk_start_number, 0);
    assert_eq!(status.merges[0].chunk_end_number, 2);

    let manager = store.db().manager();
    let merged = manager.get_chunk(0).unwrap();
    assert_eq!(merged.chunk_end_number(), 2);
    assert!(Arc::ptr_eq(&merged, &manager.get_chunk(2).unwrap()));

    assert_eq!(store.get_stream_metadata("m").unwrap().max_count, Some(1));
    assert_eq!(event_numbers(&store, "m"), vec![15]);
}

/// Several worker threads reach the same result as one.
#[test]
fn test_parallel_workers() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_mostly_hidden(&store);

    let status = store
        .scavenge(ScavengeOptions {
            threads: 4,
            ..options()
        })
        .unwrap();
    assert_eq!(status.state, ScavengeState::Completed);
    assert_eq!(status.chunks_done, 3);
    let discarded: u64 = status.chunks.iter().map(|r| r.discarded).sum();
    assert_eq!(discarded, 15);
    assert_eq!(event_numbers(&store, "m"), vec![15]);
}

// =============================================================================
// Failure and Cancellation
// =============================================================================

/// A chunk that cannot be read fails the run before the index phase.
#[test]
fn test_failed_chunk_skips_index_phase() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_metastream_overflow(&store);

    let path = store.db().manager().get_chunk(0).unwrap().path().to_path_buf();
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 8)).unwrap();
    file.write_all(&[0xA5; 8]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let status = store.scavenge(options()).unwrap();
    assert_eq!(status.state, ScavengeState::Failed);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("STREAMDB_CHUNK_CORRUPTED")));
    assert!(status.index_result.is_none());
    assert!(store.read_index().index().get_one("$$s", 0).is_some());
}

/// A run cancelled before it starts stops without touching anything.
#[test]
fn test_cancelled_run_stops() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_metastream_overflow(&store);

    let scavenger = Scavenger::new(
        Arc::clone(store.db()),
        Arc::clone(store.read_index()),
        options(),
    );
    let status = Mutex::new(ScavengeStatus::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let finished = scavenger.run(&status, &cancel);
    assert_eq!(finished.state, ScavengeState::Stopped);
    assert!(finished.index_result.is_none());
    assert!(finished.last_error.is_none());
    assert!(!store.db().manager().get_chunk(0).unwrap().is_scavenged());
    assert!(store.read_index().index().get_one("$$s", 0).is_some());
}

/// Stopping or waiting with nothing running is an error.
#[test]
fn test_stop_without_running_scavenge() {
    let dir = create_temp_data_dir();
    let store = open(&dir);

    let err = store.stop_scavenge().unwrap_err();
    assert!(matches!(err, StoreError::Scavenge(ScavengeError::NotRunning)));
    let err = store.wait_for_scavenge().unwrap_err();
    assert!(matches!(err, StoreError::Scavenge(ScavengeError::NotRunning)));
    assert!(store.scavenge_status().is_none());
}

/// Finished runs are kept in the history, newest last.
#[test]
fn test_history_records_finished_runs() {
    let dir = create_temp_data_dir();
    let store = open(&dir);
    write_metastream_overflow(&store);

    let first = store.start_scavenge_with(options()).unwrap();
    let status = store.wait_for_scavenge().unwrap();
    assert_eq!(status.id, first);
    let second = store.scavenge(options()).unwrap();

    let history = store.scavenge_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first);
    assert_eq!(history[1].id, second.id);
    assert!(history.iter().all(|s| s.state == ScavengeState::Completed));

    let latest = store.scavenge_status().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(latest.percent_complete(), 100.0);
}
