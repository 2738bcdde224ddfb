//! Typed ordering between the writer checkpoint and the checkpoints that
//! trail it.
//!
//! Only `WriterCheckpoint::flush` can produce a [`FlushedPosition`], and a
//! [`DependentCheckpoint`] can only move through `advance_to`, which takes
//! that token. A chaser, replication or index checkpoint therefore cannot be
//! made durable at a position the writer has not flushed.

use std::sync::Arc;

use super::errors::{CheckpointError, CheckpointResult};
use super::file::Checkpoint;

/// Proof that the writer checkpoint was durably flushed at this position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlushedPosition(i64);

impl FlushedPosition {
    pub(crate) fn new(position: i64) -> Self {
        Self(position)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

/// The writer checkpoint: end of durable log data
#[derive(Clone)]
pub struct WriterCheckpoint {
    inner: Arc<dyn Checkpoint>,
}

impl WriterCheckpoint {
    pub fn new(inner: Arc<dyn Checkpoint>) -> Self {
        Self { inner }
    }

    pub fn read(&self) -> i64 {
        self.inner.read()
    }

    pub fn read_non_flushed(&self) -> i64 {
        self.inner.read_non_flushed()
    }

    /// Record a new end of log. Not visible to readers until `flush`.
    pub(crate) fn write(&self, position: i64) {
        self.inner.write(position);
    }

    /// Flush the last written position. Callers must have flushed the chunk
    /// data up to that position first.
    pub(crate) fn flush(&self) -> CheckpointResult<FlushedPosition> {
        self.inner.flush()?;
        Ok(FlushedPosition::new(self.inner.read()))
    }

    /// Token for the position that is already durable
    pub fn flushed_position(&self) -> FlushedPosition {
        FlushedPosition::new(self.inner.read())
    }
}

/// A checkpoint that may never pass the flushed writer position
#[derive(Clone)]
pub struct DependentCheckpoint {
    inner: Arc<dyn Checkpoint>,
}

impl DependentCheckpoint {
    pub fn new(inner: Arc<dyn Checkpoint>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn read(&self) -> i64 {
        self.inner.read()
    }

    /// Move to `position` and flush. Fails if `position` is beyond the
    /// writer's flushed position or behind the current value.
    pub fn advance_to(&self, position: i64, bound: FlushedPosition) -> CheckpointResult<()> {
        if position > bound.value() {
            return Err(CheckpointError::order_violation(
                self.inner.name(),
                position,
                bound.value(),
            ));
        }
        let current = self.inner.read_non_flushed();
        if position < current {
            return Err(CheckpointError::order_violation(
                self.inner.name(),
                position,
                current,
            ));
        }
        self.inner.write(position);
        self.inner.flush()
    }
}
