//! Named position checkpoints.
//!
//! A checkpoint holds two values: the last written value and the last
//! flushed value. `read()` only ever returns the flushed one, so nothing
//! observes a position that is not durable yet.
//!
//! On disk a checkpoint is exactly 8 bytes: the position as little-endian
//! `i64`, in `<dir>/<name>.chk`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use super::errors::{CheckpointError, CheckpointResult};

const CHECKPOINT_FILE_SIZE: u64 = 8;

/// A durable, named i64 position
pub trait Checkpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Last flushed value
    fn read(&self) -> i64;

    /// Last written value, flushed or not
    fn read_non_flushed(&self) -> i64;

    fn write(&self, value: i64);

    /// Make the last written value durable and visible through `read()`
    fn flush(&self) -> CheckpointResult<()>;
}

/// File-backed checkpoint
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    value: AtomicI64,
    flushed: AtomicI64,
}

impl FileCheckpoint {
    /// Opens `<dir>/<name>.chk`, creating it with `initial` if missing.
    pub fn open(dir: &Path, name: &str, initial: i64) -> CheckpointResult<Self> {
        let path = dir.join(format!("{}.chk", name));
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                CheckpointError::io_failed(
                    format!("Failed to open checkpoint file: {}", path.display()),
                    e,
                )
            })?;

        let value = if exists {
            Self::read_value(&mut file, name, &path)?
        } else {
            Self::write_value(&mut file, initial, &path)?;
            sync_parent_dir(&path)?;
            initial
        };

        Ok(Self {
            name: name.to_string(),
            path,
            file: Mutex::new(file),
            value: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_value(file: &mut File, name: &str, path: &Path) -> CheckpointResult<i64> {
        let len = file
            .metadata()
            .map_err(|e| {
                CheckpointError::io_failed(
                    format!("Failed to stat checkpoint file: {}", path.display()),
                    e,
                )
            })?
            .len();
        if len != CHECKPOINT_FILE_SIZE {
            return Err(CheckpointError::corrupted(
                name,
                format!(
                    "checkpoint file is {} bytes, expected {}",
                    len, CHECKPOINT_FILE_SIZE
                ),
            ));
        }

        let mut buf = [0u8; 8];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| {
                CheckpointError::io_failed(
                    format!("Failed to read checkpoint file: {}", path.display()),
                    e,
                )
            })?;
        Ok(i64::from_le_bytes(buf))
    }

    fn write_value(file: &mut File, value: i64, path: &Path) -> CheckpointResult<()> {
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&value.to_le_bytes()))
            .and_then(|_| file.set_len(CHECKPOINT_FILE_SIZE))
            .map_err(|e| {
                CheckpointError::io_failed(
                    format!("Failed to write checkpoint file: {}", path.display()),
                    e,
                )
            })?;
        file.sync_data().map_err(|e| {
            CheckpointError::io_failed(
                format!("fsync failed for checkpoint file: {}", path.display()),
                e,
            )
        })
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    fn flush(&self) -> CheckpointResult<()> {
        let mut file = self.file.lock();
        let value = self.value.load(Ordering::Acquire);
        if value == self.flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        Self::write_value(&mut file, value, &self.path)?;
        self.flushed.store(value, Ordering::Release);
        Ok(())
    }
}

/// In-memory checkpoint for in-memory databases and tests
pub struct MemoryCheckpoint {
    name: String,
    value: AtomicI64,
    flushed: AtomicI64,
}

impl MemoryCheckpoint {
    pub fn new(name: &str, initial: i64) -> Self {
        Self {
            name: name.to_string(),
            value: AtomicI64::new(initial),
            flushed: AtomicI64::new(initial),
        }
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    fn flush(&self) -> CheckpointResult<()> {
        self.flushed
            .store(self.value.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }
}

/// fsync the directory holding `path` so a newly created entry survives a crash
fn sync_parent_dir(path: &Path) -> CheckpointResult<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent).map_err(|e| {
            CheckpointError::io_failed(
                format!("Failed to open directory: {}", parent.display()),
                e,
            )
        })?;
        dir.sync_all().map_err(|e| {
            CheckpointError::io_failed(
                format!("fsync failed for directory: {}", parent.display()),
                e,
            )
        })?;
    }
    Ok(())
}

pub(super) fn ensure_dir(dir: &Path) -> CheckpointResult<()> {
    fs::create_dir_all(dir).map_err(|e: io::Error| {
        CheckpointError::io_failed(
            format!("Failed to create checkpoint directory: {}", dir.display()),
            e,
        )
    })
}
