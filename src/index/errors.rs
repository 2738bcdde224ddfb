//! Index error types
//!
//! Error codes:
//! - STREAMDB_INDEX_IO_FAILED (ERROR)
//! - STREAMDB_INDEX_FSYNC_FAILED (FATAL)
//! - STREAMDB_INDEX_CORRUPTED (FATAL)
//! - STREAMDB_INDEX_HASH_MISMATCH (FATAL)
//! - STREAMDB_INDEX_BAD_VERSION (FATAL)
//! - STREAMDB_INDEX_DANGLING_ENTRY (FATAL)
//! - STREAMDB_INDEX_SCAVENGE_CANCELLED (ERROR)

use std::fmt;
use std::io;

/// Severity levels for index errors
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
pub enum IndexErrorCode {
    IoFailed,
    FsyncFailed,
    /// Malformed table or index map
    Corrupted,
    /// Table hash does not match its contents
    HashMismatch,
    /// Unknown table or index map format version
    BadVersion,
    /// An entry refers to a log position where no record exists
    DanglingEntry,
    /// Index scavenge stopped before swapping tables in
    ScavengeCancelled,
}

impl IndexErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            IndexErrorCode::IoFailed => "STREAMDB_INDEX_IO_FAILED",
            IndexErrorCode::FsyncFailed => "STREAMDB_INDEX_FSYNC_FAILED",
            IndexErrorCode::Corrupted => "STREAMDB_INDEX_CORRUPTED",
            IndexErrorCode::HashMismatch => "STREAMDB_INDEX_HASH_MISMATCH",
            IndexErrorCode::BadVersion => "STREAMDB_INDEX_BAD_VERSION",
            IndexErrorCode::DanglingEntry => "STREAMDB_INDEX_DANGLING_ENTRY",
            IndexErrorCode::ScavengeCancelled => "STREAMDB_INDEX_SCAVENGE_CANCELLED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IndexErrorCode::IoFailed | IndexErrorCode::ScavengeCancelled => Severity::Error,
            IndexErrorCode::FsyncFailed
            | IndexErrorCode::Corrupted
            | IndexErrorCode::HashMismatch
            | IndexErrorCode::BadVersion
            | IndexErrorCode::DanglingEntry => Severity::Fatal,
        }
    }
}

impl fmt::Display for IndexErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Index error type with full context
#[derive(Debug)]
pub struct IndexError {
    code: IndexErrorCode,
    message: String,
    /// File the error refers to, if any
    file: Option<String>,
    source: Option<io::Error>,
}

impl IndexError {
    fn new(code: IndexErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file: None,
            source: None,
        }
    }

    fn in_file(mut self, file: &str) -> Self {
        self.file = Some(file.to_string());
        self
    }

    pub fn io_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(IndexErrorCode::IoFailed, message)
        }
    }

    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(source),
            ..Self::new(IndexErrorCode::FsyncFailed, message)
        }
    }

    pub fn corrupted(file: &str, reason: impl Into<String>) -> Self {
        Self::new(IndexErrorCode::Corrupted, reason).in_file(file)
    }

    pub fn hash_mismatch(file: &str) -> Self {
        Self::new(
            IndexErrorCode::HashMismatch,
            "table hash does not match its contents",
        )
        .in_file(file)
    }

    pub fn bad_version(file: &str, reason: impl Into<String>) -> Self {
        Self::new(IndexErrorCode::BadVersion, reason).in_file(file)
    }

    pub fn dangling_entry(stream: u64, version: i64, position: i64) -> Self {
        Self::new(
            IndexErrorCode::DanglingEntry,
            format!(
                "entry (stream {:#018x}, version {}) points to log position {} where no record exists",
                stream, version, position
            ),
        )
    }

    pub fn scavenge_cancelled() -> Self {
        Self::new(
            IndexErrorCode::ScavengeCancelled,
            "index scavenge cancelled, table set unchanged",
        )
    }

    pub fn code(&self) -> IndexErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code.code(), self.message)?;
        if let Some(file) = &self.file {
            write!(f, " (file: {})", file)?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(IndexErrorCode::Corrupted.code(), "STREAMDB_INDEX_CORRUPTED");
        assert_eq!(
            IndexErrorCode::DanglingEntry.code(),
            "STREAMDB_INDEX_DANGLING_ENTRY"
        );
    }

    #[test]
    fn test_severity() {
        assert!(IndexError::hash_mismatch("t").is_fatal());
        assert!(IndexError::dangling_entry(1, 0, 10).is_fatal());
        assert!(!IndexError::scavenge_cancelled().is_fatal());
        assert!(!IndexError::io_failed("x", io::Error::other("disk")).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = IndexError::corrupted("ptable-1", "count mismatch");
        let display = format!("{}", err);
        assert!(display.contains("STREAMDB_INDEX_CORRUPTED"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("ptable-1"));
    }
}
