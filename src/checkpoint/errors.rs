//! Checkpoint error types
//!
//! Error codes:
//! - STREAMDB_CHECKPOINT_IO_FAILED (ERROR)
//! - STREAMDB_CHECKPOINT_CORRUPTED (FATAL)
//! - STREAMDB_CHECKPOINT_ORDER_VIOLATION (FATAL)
//! - STREAMDB_CHECKPOINT_AHEAD_OF_WRITER (FATAL)

use std::fmt;
use std::io;

/// Severity levels for checkpoint errors
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
pub enum CheckpointErrorCode {
    /// Reading, writing or syncing a checkpoint file failed
    IoFailed,
    /// Checkpoint file has the wrong size or cannot be parsed
    Corrupted,
    /// A dependent checkpoint was asked to move past the flushed writer position,
    /// or to move backwards
    OrderViolation,
    /// A dependent checkpoint on disk is higher than the writer checkpoint
    AheadOfWriter,
}

impl CheckpointErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            CheckpointErrorCode::IoFailed => "STREAMDB_CHECKPOINT_IO_FAILED",
            CheckpointErrorCode::Corrupted => "STREAMDB_CHECKPOINT_CORRUPTED",
            CheckpointErrorCode::OrderViolation => "STREAMDB_CHECKPOINT_ORDER_VIOLATION",
            CheckpointErrorCode::AheadOfWriter => "STREAMDB_CHECKPOINT_AHEAD_OF_WRITER",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CheckpointErrorCode::IoFailed => Severity::Error,
            CheckpointErrorCode::Corrupted
            | CheckpointErrorCode::OrderViolation
            | CheckpointErrorCode::AheadOfWriter => Severity::Fatal,
        }
    }
}

impl fmt::Display for CheckpointErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Checkpoint error with code, message, optional details and IO source
#[derive(Debug)]
pub struct CheckpointError {
    code: CheckpointErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl CheckpointError {
    pub fn io_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: CheckpointErrorCode::IoFailed,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    pub fn corrupted(name: &str, reason: impl Into<String>) -> Self {
        Self {
            code: CheckpointErrorCode::Corrupted,
            message: reason.into(),
            details: Some(format!("checkpoint: {}", name)),
            source: None,
        }
    }

    pub fn order_violation(name: &str, requested: i64, bound: i64) -> Self {
        Self {
            code: CheckpointErrorCode::OrderViolation,
            message: format!(
                "cannot move checkpoint to {} (allowed bound {})",
                requested, bound
            ),
            details: Some(format!("checkpoint: {}", name)),
            source: None,
        }
    }

    pub fn ahead_of_writer(name: &str, value: i64, writer: i64) -> Self {
        Self {
            code: CheckpointErrorCode::AheadOfWriter,
            message: format!(
                "{} checkpoint {} is higher than writer checkpoint {}",
                name, value, writer
            ),
            details: Some(format!("checkpoint: {}", name)),
            source: None,
        }
    }

    pub fn code(&self) -> CheckpointErrorCode {
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
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;
