//! Chunk database: the chunk manager plus the checkpoints that bound it.
//!
//! `open` validates the directory against the writer checkpoint before
//! anything reads or writes the log:
//!
//! 1. Temporary scavenge files are deleted.
//! 2. Every chunk number from 0 to the writer checkpoint's chunk must have a
//!    file; the highest version wins. A gap is fatal.
//! 3. Chunk files beyond the writer checkpoint are fatal.
//! 4. Older versions, and files shadowed by a merged chunk, are deleted.
//! 5. If the last chunk is completed and the writer checkpoint is at its
//!    logical end (a crash between completion and the checkpoint flush),
//!    the writer checkpoint moves to the chunk end.
//! 6. A writable chunk is created if the writer checkpoint is at a chunk
//!    boundary.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::CheckpointSet;
use crate::config::DbConfig;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::tlog::chunk::{Chunk, ChunkFooter, FOOTER_SIZE};
use crate::tlog::errors::{ChunkError, ChunkResult};
use crate::tlog::manager::ChunkManager;
use crate::tlog::naming::{ChunkFileName, ChunkNaming};

pub struct ChunkDb {
    config: DbConfig,
    manager: ChunkManager,
    checkpoints: CheckpointSet,
    metrics: Arc<MetricsRegistry>,
}

impl ChunkDb {
    pub fn open(
        config: &DbConfig,
        checkpoints: CheckpointSet,
        metrics: Arc<MetricsRegistry>,
    ) -> ChunkResult<Self> {
        let naming = ChunkNaming::new(config.chunks_dir(), &config.chunk_file_prefix);
        let manager = ChunkManager::new(
            config.chunk_size,
            naming,
            config.chunk_options(Arc::clone(&metrics)),
        );
        let db = Self {
            config: config.clone(),
            manager,
            checkpoints,
            metrics,
        };

        if config.in_memory {
            if db.checkpoints.writer.read() != 0 {
                return Err(ChunkError::invariant(
                    "in-memory database must start with an empty log",
                ));
            }
        } else {
            fs::create_dir_all(config.chunks_dir()).map_err(|e| {
                ChunkError::io_failed(
                    format!(
                        "Failed to create data directory: {}",
                        config.chunks_dir().display()
                    ),
                    e,
                )
            })?;
            db.load_chunks()?;
        }

        let writer_pos = db.checkpoints.writer.read();
        if db.manager.chunks_count() as i64 * config.chunk_size as i64 <= writer_pos {
            db.manager.add_new_chunk()?;
        }
        Ok(db)
    }

    fn load_chunks(&self) -> ChunkResult<()> {
        let naming = self.manager.naming();
        let chunk_size = self.config.chunk_size as i64;
        let options = self.manager.options().clone();

        for temp in naming
            .enumerate_temp_files()
            .map_err(|e| ChunkError::io_failed("Failed to list temporary chunk files", e))?
        {
            remove_stale(&temp, "temporary scavenge output")?;
        }

        let files = naming
            .enumerate_files()
            .map_err(|e| ChunkError::io_failed("Failed to list chunk files", e))?;

        let mut writer_pos = self.checkpoints.writer.read();
        let last_chunk_number = (writer_pos / chunk_size) as i32;
        let mut in_use: HashSet<PathBuf> = HashSet::new();

        let mut number = 0i32;
        while number <= last_chunk_number {
            let Some(best) = best_version(&files, number) else {
                if number == last_chunk_number && writer_pos == number as i64 * chunk_size {
                    break;
                }
                return Err(ChunkError::chunk_missing(number));
            };

            let chunk = if is_completed_file(&best.path)? {
                Chunk::open_completed(&best.path, self.config.verify_chunk_hashes, &options)?
            } else {
                if number != last_chunk_number {
                    return Err(ChunkError::corrupted(
                        &best.path.display().to_string(),
                        format!(
                            "chunk #{} is not completed but the writer checkpoint is in chunk #{}",
                            number, last_chunk_number
                        ),
                    ));
                }
                let local = writer_pos - number as i64 * chunk_size;
                Chunk::open_ongoing(&best.path, local, &options)?
            };

            if chunk.chunk_start_number() != number {
                return Err(ChunkError::corrupted(
                    chunk.name(),
                    format!(
                        "file name says chunk #{}, header says #{}",
                        number,
                        chunk.chunk_start_number()
                    ),
                ));
            }

            in_use.insert(best.path.clone());
            number = chunk.chunk_end_number() + 1;
            self.manager.add_chunk(Arc::new(chunk))?;
        }

        if let Some(last) = self.manager.last_chunk() {
            if last.is_completed() && writer_pos < last.chunk_end_position() {
                if writer_pos == last.chunk_start_position() + last.logical_data_size() {
                    writer_pos = last.chunk_end_position();
                    self.checkpoints.writer.write(writer_pos);
                    self.checkpoints.writer.flush()?;
                } else {
                    return Err(ChunkError::corrupted(
                        last.name(),
                        format!(
                            "chunk is completed at logical size {} but the writer checkpoint is {}",
                            last.logical_data_size(),
                            writer_pos
                        ),
                    ));
                }
            }
        }

        let covered = self.manager.chunks_count();
        for file in &files {
            if in_use.contains(&file.path) {
                continue;
            }
            if file.number >= covered && file.number as i64 * chunk_size > writer_pos {
                return Err(ChunkError::extraneous_chunk(
                    &file.path.display().to_string(),
                    format!(
                        "chunk #{} is beyond the writer checkpoint {}",
                        file.number, writer_pos
                    ),
                ));
            }
            if file.number >= covered {
                // writable chunk created at a boundary before the crash,
                // it never received a record
                remove_stale(&file.path, "empty chunk at the writer boundary")?;
                continue;
            }
            remove_stale(&file.path, "superseded chunk version")?;
        }
        Ok(())
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    pub fn checkpoints(&self) -> &CheckpointSet {
        &self.checkpoints
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn chunk_size(&self) -> i32 {
        self.config.chunk_size
    }
}

fn best_version(files: &[ChunkFileName], number: i32) -> Option<&ChunkFileName> {
    files
        .iter()
        .filter(|f| f.number == number)
        .max_by_key(|f| f.version)
}

fn is_completed_file(path: &std::path::Path) -> ChunkResult<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path).map_err(|e| {
        ChunkError::io_failed(format!("Failed to open chunk: {}", path.display()), e)
    })?;
    let len = file
        .metadata()
        .map_err(|e| ChunkError::io_failed(format!("Failed to stat chunk: {}", path.display()), e))?
        .len();
    if len < FOOTER_SIZE as u64 {
        return Ok(false);
    }
    let mut tail = [0u8; FOOTER_SIZE];
    file.seek(SeekFrom::Start(len - FOOTER_SIZE as u64))
        .and_then(|_| file.read_exact(&mut tail))
        .map_err(|e| {
            ChunkError::io_failed(format!("Failed to read footer: {}", path.display()), e)
        })?;
    Ok(ChunkFooter::is_completed_block(&tail))
}

fn remove_stale(path: &std::path::Path, reason: &str) -> ChunkResult<()> {
    fs::remove_file(path).map_err(|e| {
        ChunkError::io_failed(format!("Failed to remove {}", path.display()), e)
    })?;
    log_event_with_fields(
        Event::ChunkFileRemoved,
        &[("file", &path.display().to_string()), ("reason", reason)],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlog::chunk::AppendResult;
    use crate::tlog::errors::ChunkErrorCode;
    use crate::tlog::record::{LogRecord, PrepareRecord};
    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> DbConfig {
        DbConfig {
            chunk_size: 4096,
            ..DbConfig::new(dir)
        }
    }

    fn open(dir: &std::path::Path) -> ChunkResult<ChunkDb> {
        let checkpoints = CheckpointSet::open(dir).unwrap();
        ChunkDb::open(&config(dir), checkpoints, Arc::new(MetricsRegistry::new()))
    }

    /// Append one record to the writable chunk and flush the writer checkpoint
    fn append(db: &ChunkDb) -> i64 {
        let chunk = db.manager().last_chunk().unwrap();
        let pos = chunk.chunk_start_position() + chunk.physical_data_size();
        let mut record = LogRecord::Prepare(PrepareRecord::single_write("s", -1, "e", vec![7; 32]));
        record.rebase(pos);
        let new_position = match chunk.try_append(&record).unwrap() {
            AppendResult::Written { new_position, .. } => new_position,
            AppendResult::Full => panic!("full"),
        };
        chunk.flush().unwrap();
        let end = chunk.chunk_start_position() + new_position;
        db.checkpoints().writer.write(end);
        db.checkpoints().writer.flush().unwrap();
        end
    }

    #[test]
    fn test_fresh_directory_gets_first_chunk() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path()).unwrap();
        assert_eq!(db.manager().chunks_count(), 1);
        assert!(dir.path().join("chunk-000000.000000").exists());
    }

    #[test]
    fn test_reopen_continues_ongoing_chunk() {
        let dir = TempDir::new().unwrap();
        let end = {
            let db = open(dir.path()).unwrap();
            append(&db);
            append(&db)
        };

        let db = open(dir.path()).unwrap();
        let last = db.manager().last_chunk().unwrap();
        assert!(!last.is_completed());
        assert_eq!(last.physical_data_size(), end);
    }

    #[test]
    fn test_missing_chunk_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(dir.path()).unwrap();
            append(&db);
            let first = db.manager().get_chunk(0).unwrap();
            first.complete().unwrap();
            db.checkpoints().writer.write(4096);
            db.checkpoints().writer.flush().unwrap();
            db.manager().add_new_chunk().unwrap();
            append(&db);
        }
        fs::remove_file(dir.path().join("chunk-000000.000000")).unwrap();

        let err = open(dir.path()).err().expect("gap must be fatal");
        assert_eq!(err.code(), ChunkErrorCode::ChunkMissing);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_extraneous_chunk_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(dir.path()).unwrap();
            append(&db);
        }
        fs::write(dir.path().join("chunk-000005.000000"), b"stray").unwrap();

        let err = open(dir.path()).err().expect("stray chunk must be fatal");
        assert_eq!(err.code(), ChunkErrorCode::ExtraneousChunk);
    }

    #[test]
    fn test_completed_chunk_without_checkpoint_advance_is_repaired() {
        let dir = TempDir::new().unwrap();
        let end = {
            let db = open(dir.path()).unwrap();
            let end = append(&db);
            // crash after completion, before the checkpoint moved to the chunk end
            db.manager().get_chunk(0).unwrap().complete().unwrap();
            end
        };
        assert!(end < 4096);

        let db = open(dir.path()).unwrap();
        assert_eq!(db.checkpoints().writer.read(), 4096);
        assert_eq!(db.manager().chunks_count(), 2);
    }

    #[test]
    fn test_temp_files_and_old_versions_are_removed() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(dir.path()).unwrap();
            append(&db);
        }
        let temp = dir.path().join("abc.scavenge.tmp");
        fs::write(&temp, b"partial").unwrap();

        open(dir.path()).unwrap();
        assert!(!temp.exists());
    }

    #[test]
    fn test_writer_checkpoint_beyond_data_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(dir.path()).unwrap();
            let end = append(&db);
            db.checkpoints().writer.write(end + 100);
            db.checkpoints().writer.flush().unwrap();
        }
        let err = open(dir.path()).err().expect("checkpoint beyond data must be fatal");
        assert!(err.is_fatal());
    }
}
