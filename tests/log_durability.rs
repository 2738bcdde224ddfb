//! Transaction Log Durability Tests
//!
//! Tests for the chunked log:
//! - Records are readable at the position the writer returned
//! - A record never straddles two chunks
//! - A full chunk is completed before the next one is opened
//! - Flushed records survive reopen, unflushed ones do not
//! - The sequential reader walks the log in both directions

use std::fs;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use streamdb::config::DbConfig;
use streamdb::recovery::recover;
use streamdb::tlog::{ChunkDb, ChunkErrorCode, LogRecord, LogReader, LogWriter, PrepareRecord, ReadTracker};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

const CHUNK_SIZE: i32 = 4096;

fn create_temp_data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

fn disk_config(dir: &TempDir) -> DbConfig {
    let mut config = DbConfig::new(dir.path());
    config.chunk_size = CHUNK_SIZE;
    config
}

fn open_db(config: &DbConfig) -> Arc<ChunkDb> {
    recover(config).expect("recovery failed").db
}

fn event(stream: &str, expected: i64, size: usize) -> LogRecord {
    LogRecord::Prepare(PrepareRecord::single_write(
        stream,
        expected,
        "test-event",
        vec![(expected + 1) as u8; size],
    ))
}

fn chunk_files(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .expect("read data dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("chunk-"))
        .collect();
    names.sort();
    names
}

// =============================================================================
// Positions
// =============================================================================

/// Every record reads back at the log position the writer returned.
#[test]
fn test_records_readable_at_written_positions() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();

    let mut positions = Vec::new();
    for i in 0..10 {
        positions.push(writer.write(event("s", i - 1, 50)).unwrap());
    }
    writer.flush().unwrap();

    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");
    for (i, written) in positions.iter().enumerate() {
        let read = reader
            .try_read_at(written.log_position, false, &tracker)
            .unwrap()
            .expect("record missing");
        let prepare = read.record.as_prepare().expect("not a prepare");
        assert_eq!(prepare.log_position, written.log_position);
        assert_eq!(prepare.expected_version, i as i64 - 1);
        assert_eq!(read.next_position, written.new_position);
    }
    assert_eq!(tracker.records_read(), 10);
}

/// Reading at or past the writer checkpoint finds nothing.
#[test]
fn test_read_past_writer_is_empty() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    let written = writer.write(event("s", -1, 10)).unwrap();
    writer.flush().unwrap();

    let reader = LogReader::new(db);
    let tracker = ReadTracker::new("test");
    assert!(reader
        .try_read_at(written.new_position, false, &tracker)
        .unwrap()
        .is_none());
    assert!(reader.try_read_at(-1, false, &tracker).is_err());
}

// =============================================================================
// Chunk Boundaries
// =============================================================================

/// Five records of about 1000 bytes in 4096-byte chunks: the fourth one
/// does not fit and moves to the second chunk whole.
#[test]
fn test_records_never_straddle_chunks() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();

    let written: Vec<_> = (0..5)
        .map(|i| writer.write(event("s", i - 1, 1000)).unwrap())
        .collect();
    writer.flush().unwrap();

    assert!(db.manager().chunks_count() >= 2);
    for w in &written {
        let chunk_of_start = w.log_position / CHUNK_SIZE as i64;
        let chunk_of_last_byte = (w.new_position - 1) / CHUNK_SIZE as i64;
        assert_eq!(
            chunk_of_start, chunk_of_last_byte,
            "record at {} crosses a chunk boundary",
            w.log_position
        );
    }
    assert_eq!(written[3].log_position, CHUNK_SIZE as i64);

    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");
    for (i, w) in written.iter().enumerate() {
        assert!(reader.exists_at(w.log_position, &tracker).unwrap());
        let read = reader
            .try_read_at(w.log_position, false, &tracker)
            .unwrap()
            .expect("record missing");
        let prepare = read.record.as_prepare().expect("not a prepare");
        assert_eq!(prepare.expected_version, i as i64 - 1);
        assert_eq!(prepare.data, vec![i as u8; 1000]);
        assert_eq!(read.next_position, w.new_position);
    }

    let end = written[4].new_position;
    assert!(!reader.exists_at(end, &tracker).unwrap());
    assert!(reader.try_read_at(end, false, &tracker).unwrap().is_none());
}

/// Rolling over completes the previous chunk and writes it to disk.
#[test]
fn test_rollover_completes_previous_chunk() {
    let dir = create_temp_data_dir();
    let db = open_db(&disk_config(&dir));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    for i in 0..5 {
        writer.write(event("s", i - 1, 1000)).unwrap();
    }
    writer.flush().unwrap();

    let first = db.manager().get_chunk(0).unwrap();
    assert!(first.is_completed());
    assert!(!first.is_scavenged());
    assert_eq!(first.chunk_end_position(), CHUNK_SIZE as i64);

    let last = db.manager().last_chunk().unwrap();
    assert!(!last.is_completed());
    assert_eq!(last.chunk_start_number(), 1);

    assert_eq!(chunk_files(&dir), vec!["chunk-000000.000000", "chunk-000001.000000"]);
}

/// A record that cannot fit in an empty chunk is rejected and the writer
/// stays usable.
#[test]
fn test_record_larger_than_chunk_rejected() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    let before = writer.position();

    let err = writer.write(event("s", -1, 5000)).unwrap_err();
    assert_eq!(err.code(), ChunkErrorCode::RecordTooLarge);
    assert_eq!(writer.position(), before);
    assert_eq!(db.manager().chunks_count(), 1);

    let written = writer.write(event("s", -1, 100)).unwrap();
    assert_eq!(written.log_position, before);
}

/// Records of random sizes fill chunks unevenly; every one of them reads
/// back intact after reopen.
#[test]
fn test_random_sizes_survive_reopen() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let sizes: Vec<usize> = (0..60).map(|_| rng.gen_range(1..1500)).collect();

    let mut written = Vec::new();
    {
        let db = open_db(&config);
        let writer = LogWriter::open(Arc::clone(&db)).unwrap();
        for (i, &size) in sizes.iter().enumerate() {
            written.push(writer.write(event("s", i as i64 - 1, size)).unwrap());
        }
        writer.flush().unwrap();
    }

    let db = open_db(&config);
    assert!(db.manager().chunks_count() > 1);
    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");
    for (i, w) in written.iter().enumerate() {
        let read = reader
            .try_read_at(w.log_position, false, &tracker)
            .unwrap()
            .expect("record lost");
        let prepare = read.record.as_prepare().unwrap();
        assert_eq!(prepare.data.len(), sizes[i]);
        assert_eq!(read.next_position, w.new_position);
    }
}

// =============================================================================
// Reopen
// =============================================================================

/// Flushed records survive reopen and the writer continues after them.
#[test]
fn test_flushed_records_survive_reopen() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);

    let last_written;
    {
        let db = open_db(&config);
        let writer = LogWriter::open(Arc::clone(&db)).unwrap();
        let mut last = None;
        for i in 0..8 {
            last = Some(writer.write(event("s", i - 1, 700)).unwrap());
        }
        writer.flush().unwrap();
        last_written = last.unwrap();
    }

    let db = open_db(&config);
    assert_eq!(db.checkpoints().writer.read(), last_written.new_position);

    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");
    let read = reader
        .try_read_at(last_written.log_position, false, &tracker)
        .unwrap()
        .expect("last record lost");
    assert_eq!(read.record.as_prepare().unwrap().expected_version, 6);

    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    assert_eq!(writer.position(), last_written.new_position);
    let next = writer.write(event("s", 7, 10)).unwrap();
    assert_eq!(next.log_position, last_written.new_position);
}

/// Records written but never flushed are not part of the log after reopen.
#[test]
fn test_unflushed_records_ignored_on_reopen() {
    let dir = create_temp_data_dir();
    let config = disk_config(&dir);

    let flushed_to;
    {
        let db = open_db(&config);
        let writer = LogWriter::open(Arc::clone(&db)).unwrap();
        writer.write(event("s", -1, 100)).unwrap();
        flushed_to = writer.flush().unwrap().value();
        writer.write(event("s", 0, 100)).unwrap();
        writer.write(event("s", 1, 100)).unwrap();
    }

    let db = open_db(&config);
    assert_eq!(db.checkpoints().writer.read(), flushed_to);

    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");
    assert!(reader.try_read_at(flushed_to, false, &tracker).unwrap().is_none());

    // The next record overwrites the ignored tail
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    let written = writer.write(event("other", -1, 20)).unwrap();
    writer.flush().unwrap();
    assert_eq!(written.log_position, flushed_to);
    let read = reader
        .try_read_at(flushed_to, false, &tracker)
        .unwrap()
        .unwrap();
    assert_eq!(read.record.as_prepare().unwrap().event_stream_id, "other");
}

// =============================================================================
// Sequential Reads
// =============================================================================

/// Forward and backward walks see the same records in opposite orders,
/// across chunk boundaries.
#[test]
fn test_seq_reader_walks_both_directions() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    let written: Vec<_> = (0..12)
        .map(|i| writer.write(event("s", i - 1, 600)).unwrap())
        .collect();
    writer.flush().unwrap();
    assert!(db.manager().chunks_count() >= 2);

    let reader = LogReader::new(Arc::clone(&db));
    let tracker = ReadTracker::new("test");

    let mut forward = Vec::new();
    let mut seq = reader.seq_reader(0);
    while let Some(read) = seq.try_read_next(&tracker).unwrap() {
        assert_eq!(read.record.log_position(), read.record_pre_position);
        forward.push((read.record_pre_position, read.record_post_position));
    }
    let expected: Vec<_> = written
        .iter()
        .map(|w| (w.log_position, w.new_position))
        .collect();
    assert_eq!(forward, expected);

    let mut backward = Vec::new();
    let mut seq = reader.seq_reader(reader.writer_position());
    while let Some(read) = seq.try_read_prev(&tracker).unwrap() {
        backward.push((read.record_pre_position, read.record_post_position));
    }
    backward.reverse();
    assert_eq!(backward, expected);
}

/// A sequential reader positioned inside the log resumes from there.
#[test]
fn test_seq_reader_reposition() {
    let db = open_db(&DbConfig::in_memory(CHUNK_SIZE));
    let writer = LogWriter::open(Arc::clone(&db)).unwrap();
    let written: Vec<_> = (0..4)
        .map(|i| writer.write(event("s", i - 1, 30)).unwrap())
        .collect();
    writer.flush().unwrap();

    let reader = LogReader::new(db);
    let tracker = ReadTracker::new("test");
    let mut seq = reader.seq_reader(0);
    seq.reposition(written[2].log_position);
    let read = seq.try_read_next(&tracker).unwrap().unwrap();
    assert_eq!(read.record_pre_position, written[2].log_position);
    assert_eq!(seq.position(), written[2].new_position);
}
