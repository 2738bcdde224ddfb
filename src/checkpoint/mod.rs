//! Checkpoints
//!
//! Durable, monotonically advancing i64 positions: Writer, Chaser, Epoch,
//! Truncate, Replication and Index. Writes follow flush-then-publish: a value
//! becomes visible through `read()` only after it has been fsynced.
//!
//! # Ordering
//!
//! The writer checkpoint is the end of durable log data. Chaser, Replication
//! and Index trail it and can only be advanced with a [`FlushedPosition`]
//! obtained from flushing the writer, see [`ordered`].

mod errors;
mod file;
pub mod ordered;
mod set;

pub use errors::{CheckpointError, CheckpointErrorCode, CheckpointResult, Severity};
pub use file::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
pub use ordered::{DependentCheckpoint, FlushedPosition, WriterCheckpoint};
pub use set::CheckpointSet;
