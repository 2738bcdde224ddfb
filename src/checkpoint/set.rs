//! The full set of checkpoints a database keeps.

use std::path::Path;
use std::sync::Arc;

use super::errors::{CheckpointError, CheckpointResult};
use super::file::{ensure_dir, Checkpoint, FileCheckpoint, MemoryCheckpoint};
use super::ordered::{DependentCheckpoint, WriterCheckpoint};

pub const WRITER: &str = "writer";
pub const CHASER: &str = "chaser";
pub const EPOCH: &str = "epoch";
pub const TRUNCATE: &str = "truncate";
pub const REPLICATION: &str = "replication";
pub const INDEX: &str = "index";

/// Writer, Chaser, Epoch, Truncate, Replication and Index checkpoints
#[derive(Clone)]
pub struct CheckpointSet {
    pub writer: WriterCheckpoint,
    pub chaser: DependentCheckpoint,
    pub replication: DependentCheckpoint,
    pub index: DependentCheckpoint,
    pub epoch: Arc<dyn Checkpoint>,
    pub truncate: Arc<dyn Checkpoint>,
}

impl CheckpointSet {
    /// Open (or create) one checkpoint file per name under `dir`.
    pub fn open(dir: &Path) -> CheckpointResult<Self> {
        ensure_dir(dir)?;
        let open = |name: &str, initial: i64| -> CheckpointResult<Arc<dyn Checkpoint>> {
            Ok(Arc::new(FileCheckpoint::open(dir, name, initial)?))
        };

        Ok(Self {
            writer: WriterCheckpoint::new(open(WRITER, 0)?),
            chaser: DependentCheckpoint::new(open(CHASER, 0)?),
            replication: DependentCheckpoint::new(open(REPLICATION, 0)?),
            index: DependentCheckpoint::new(open(INDEX, 0)?),
            epoch: open(EPOCH, -1)?,
            truncate: open(TRUNCATE, -1)?,
        })
    }

    pub fn in_memory() -> Self {
        let mem = |name: &str, initial: i64| -> Arc<dyn Checkpoint> {
            Arc::new(MemoryCheckpoint::new(name, initial))
        };

        Self {
            writer: WriterCheckpoint::new(mem(WRITER, 0)),
            chaser: DependentCheckpoint::new(mem(CHASER, 0)),
            replication: DependentCheckpoint::new(mem(REPLICATION, 0)),
            index: DependentCheckpoint::new(mem(INDEX, 0)),
            epoch: mem(EPOCH, -1),
            truncate: mem(TRUNCATE, -1),
        }
    }

    /// Every dependent checkpoint must be at or below the writer checkpoint.
    pub fn validate(&self) -> CheckpointResult<()> {
        let writer = self.writer.read();
        for dependent in [&self.chaser, &self.replication, &self.index] {
            if dependent.read() > writer {
                return Err(CheckpointError::ahead_of_writer(
                    dependent.name(),
                    dependent.read(),
                    writer,
                ));
            }
        }
        Ok(())
    }
}
