use thiserror::Error;

use crate::index::IndexError;
use crate::tlog::errors::ChunkError;

pub type ReadIndexResult<T> = Result<T, ReadIndexError>;

#[derive(Debug, Error)]
pub enum ReadIndexError {
    #[error(transparent)]
    Log(#[from] ChunkError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl ReadIndexError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ReadIndexError::Log(e) => e.is_fatal(),
            ReadIndexError::Index(e) => e.is_fatal(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ReadIndexError::Log(e) => e.code().code(),
            ReadIndexError::Index(e) => e.code().code(),
        }
    }
}
