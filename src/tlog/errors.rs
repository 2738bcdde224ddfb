//! Transaction log error types
//!
//! Error codes:
//! - STREAMDB_CHUNK_IO_FAILED (ERROR)
//! - STREAMDB_CHUNK_FSYNC_FAILED (FATAL)
//! - STREAMDB_CHUNK_CORRUPTED (FATAL)
//! - STREAMDB_CHUNK_HASH_MISMATCH (FATAL)
//! - STREAMDB_CHUNK_BAD_VERSION (FATAL)
//! - STREAMDB_CHUNK_MISSING (FATAL)
//! - STREAMDB_CHUNK_EXTRANEOUS (FATAL)
//! - STREAMDB_FILE_BEING_DELETED (ERROR, transient)
//! - STREAMDB_READER_POOL_EXHAUSTED (ERROR)
//! - STREAMDB_CHUNK_READ_ONLY (ERROR)
//! - STREAMDB_RECORD_TOO_LARGE (ERROR)
//! - STREAMDB_LOG_INVARIANT (FATAL)

use std::fmt;
use std::io;

use super::record::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, store continues
    Error,
    /// Store must not continue
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkErrorCode {
    IoFailed,
    FsyncFailed,
    /// Bad header, footer or record frame
    Corrupted,
    /// Footer hash does not match the file contents
    HashMismatch,
    /// Unknown file type or format version
    BadVersion,
    /// A chunk expected from the writer checkpoint is not on disk
    ChunkMissing,
    /// A chunk file exists beyond the writer checkpoint
    ExtraneousChunk,
    /// The chunk was replaced and is waiting for its readers to leave
    FileBeingDeleted,
    /// No reader handle became free within the configured wait
    ReaderPoolExhausted,
    /// Append on a completed chunk
    ReadOnly,
    /// Record does not fit into an empty chunk
    RecordTooLarge,
    /// Position, chunk number or range that cannot exist
    InvariantViolation,
}

impl ChunkErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ChunkErrorCode::IoFailed => "STREAMDB_CHUNK_IO_FAILED",
            ChunkErrorCode::FsyncFailed => "STREAMDB_CHUNK_FSYNC_FAILED",
            ChunkErrorCode::Corrupted => "STREAMDB_CHUNK_CORRUPTED",
            ChunkErrorCode::HashMismatch => "STREAMDB_CHUNK_HASH_MISMATCH",
            ChunkErrorCode::BadVersion => "STREAMDB_CHUNK_BAD_VERSION",
            ChunkErrorCode::ChunkMissing => "STREAMDB_CHUNK_MISSING",
            ChunkErrorCode::ExtraneousChunk => "STREAMDB_CHUNK_EXTRANEOUS",
            ChunkErrorCode::FileBeingDeleted => "STREAMDB_FILE_BEING_DELETED",
            ChunkErrorCode::ReaderPoolExhausted => "STREAMDB_READER_POOL_EXHAUSTED",
            ChunkErrorCode::ReadOnly => "STREAMDB_CHUNK_READ_ONLY",
            ChunkErrorCode::RecordTooLarge => "STREAMDB_RECORD_TOO_LARGE",
            ChunkErrorCode::InvariantViolation => "STREAMDB_LOG_INVARIANT",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ChunkErrorCode::IoFailed
            | ChunkErrorCode::FileBeingDeleted
            | ChunkErrorCode::ReaderPoolExhausted
            | ChunkErrorCode::ReadOnly
            | ChunkErrorCode::RecordTooLarge => Severity::Error,
            ChunkErrorCode::FsyncFailed
            | ChunkErrorCode::Corrupted
            | ChunkErrorCode::HashMismatch
            | ChunkErrorCode::BadVersion
            | ChunkErrorCode::ChunkMissing
            | ChunkErrorCode::ExtraneousChunk
            | ChunkErrorCode::InvariantViolation => Severity::Fatal,
        }
    }
}

impl fmt::Display for ChunkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error raised by chunks, the chunk manager, the writer and readers
#[derive(Debug)]
pub struct ChunkError {
    code: ChunkErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl ChunkError {
    fn new(code: ChunkErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn io_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(ChunkErrorCode::IoFailed, message)
        }
    }

    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(ChunkErrorCode::FsyncFailed, message)
        }
    }

    pub fn corrupted(chunk: &str, reason: impl Into<String>) -> Self {
        Self::new(ChunkErrorCode::Corrupted, reason).with_details(format!("chunk: {}", chunk))
    }

    pub fn corrupted_at(chunk: &str, offset: i64, reason: impl Into<String>) -> Self {
        Self::new(ChunkErrorCode::Corrupted, reason)
            .with_details(format!("chunk: {}, offset: {}", chunk, offset))
    }

    pub fn hash_mismatch(chunk: &str) -> Self {
        Self::new(
            ChunkErrorCode::HashMismatch,
            "content hash does not match footer",
        )
        .with_details(format!("chunk: {}", chunk))
    }

    pub fn bad_version(chunk: &str, reason: impl Into<String>) -> Self {
        Self::new(ChunkErrorCode::BadVersion, reason).with_details(format!("chunk: {}", chunk))
    }

    pub fn chunk_missing(chunk_number: i32) -> Self {
        Self::new(
            ChunkErrorCode::ChunkMissing,
            format!("chunk #{} is required by the writer checkpoint", chunk_number),
        )
    }

    pub fn extraneous_chunk(file: &str, reason: impl Into<String>) -> Self {
        Self::new(ChunkErrorCode::ExtraneousChunk, reason).with_details(format!("file: {}", file))
    }

    pub fn file_being_deleted(chunk: &str) -> Self {
        Self::new(
            ChunkErrorCode::FileBeingDeleted,
            "chunk was replaced and is being deleted",
        )
        .with_details(format!("chunk: {}", chunk))
    }

    pub fn reader_pool_exhausted(chunk: &str, waited_ms: u64) -> Self {
        Self::new(
            ChunkErrorCode::ReaderPoolExhausted,
            format!("no reader handle became available within {}ms", waited_ms),
        )
        .with_details(format!("chunk: {}", chunk))
    }

    pub fn read_only(chunk: &str) -> Self {
        Self::new(ChunkErrorCode::ReadOnly, "chunk is completed and read-only")
            .with_details(format!("chunk: {}", chunk))
    }

    pub fn record_too_large(size: usize, chunk_size: i64) -> Self {
        Self::new(
            ChunkErrorCode::RecordTooLarge,
            format!(
                "record of {} bytes does not fit a chunk of {} bytes",
                size, chunk_size
            ),
        )
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ChunkErrorCode::InvariantViolation, message)
    }

    pub fn code(&self) -> ChunkErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Readers retry these against the refreshed chunk set
    pub fn is_transient(&self) -> bool {
        self.code == ChunkErrorCode::FileBeingDeleted
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::checkpoint::CheckpointError> for ChunkError {
    fn from(err: crate::checkpoint::CheckpointError) -> Self {
        let code = if err.is_fatal() {
            ChunkErrorCode::InvariantViolation
        } else {
            ChunkErrorCode::IoFailed
        };
        Self::new(code, format!("checkpoint: {}", err))
    }
}

pub(crate) fn codec_error(chunk: &str, offset: i64, err: CodecError) -> ChunkError {
    ChunkError::corrupted_at(chunk, offset, format!("record decode failed: {}", err))
}

pub type ChunkResult<T> = Result<T, ChunkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_being_deleted_is_transient_not_fatal() {
        let err = ChunkError::file_being_deleted("chunk-000001.000000");
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        assert!(ChunkError::hash_mismatch("chunk-000000.000001").is_fatal());
        assert!(ChunkError::chunk_missing(3).is_fatal());
        assert!(ChunkError::extraneous_chunk("chunk-000009.000000", "beyond writer").is_fatal());
        assert!(ChunkError::corrupted_at("c", 128, "bad frame").is_fatal());
    }

    #[test]
    fn test_pool_exhaustion_is_not_fatal() {
        let err = ChunkError::reader_pool_exhausted("chunk-000000.000000", 250);
        assert!(!err.is_fatal());
        assert!(format!("{}", err).contains("STREAMDB_READER_POOL_EXHAUSTED"));
    }

    #[test]
    fn test_display_contains_details() {
        let err = ChunkError::corrupted_at("chunk-000002.000000", 4096, "length prefix/suffix mismatch");
        let display = format!("{}", err);
        assert!(display.contains("FATAL"));
        assert!(display.contains("STREAMDB_CHUNK_CORRUPTED"));
        assert!(display.contains("offset: 4096"));
    }
}
