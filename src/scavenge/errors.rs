use std::io;

use thiserror::Error;
use uuid::Uuid;

use super::state::ScavengeState;
use crate::index::IndexError;
use crate::readindex::ReadIndexError;
use crate::tlog::errors::ChunkError;

pub type ScavengeResult<T> = Result<T, ScavengeError>;

#[derive(Debug, Error)]
pub enum ScavengeError {
    #[error(transparent)]
    Log(#[from] ChunkError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    ReadIndex(#[from] ReadIndexError),
    #[error("scavenge cancelled")]
    Cancelled,
    #[error("scavenge {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("no scavenge is running")]
    NotRunning,
    #[error("invalid scavenge state transition {from} -> {to}")]
    InvalidTransition { from: ScavengeState, to: ScavengeState },
    #[error("failed to spawn scavenge thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("scavenge worker panicked")]
    WorkerPanicked,
}

impl ScavengeError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ScavengeError::Cancelled => true,
            ScavengeError::Index(e) => e.code() == crate::index::IndexErrorCode::ScavengeCancelled,
            _ => false,
        }
    }
}
