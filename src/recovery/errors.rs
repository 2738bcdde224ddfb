//! Recovery error types
//!
//! Error codes:
//! - STREAMDB_RECOVERY_CONFIG_INVALID (FATAL)
//! - STREAMDB_RECOVERY_CHECKPOINT_FAILED (FATAL)
//! - STREAMDB_RECOVERY_LOG_FAILED (FATAL)
//! - STREAMDB_RECOVERY_INDEX_FAILED (FATAL)
//! - STREAMDB_RECOVERY_INDEX_AHEAD_OF_LOG (FATAL)
//! - STREAMDB_RECOVERY_REINDEX_FAILED (FATAL)
//!
//! Every recovery error stops the store from opening. The code of the
//! subsystem error that caused it, if any, is kept as `cause_code`.

use std::error::Error as StdError;
use std::fmt;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::index::IndexError;
use crate::readindex::ReadIndexError;
use crate::tlog::errors::ChunkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryErrorCode {
    ConfigInvalid,
    /// Checkpoints could not be opened or are out of order
    CheckpointFailed,
    /// The chunk directory does not match the writer checkpoint
    LogFailed,
    IndexFailed,
    /// The index claims to cover log data the writer never made durable
    IndexAheadOfLog,
    /// Replaying the log into the index failed
    ReindexFailed,
}

impl RecoveryErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryErrorCode::ConfigInvalid => "STREAMDB_RECOVERY_CONFIG_INVALID",
            RecoveryErrorCode::CheckpointFailed => "STREAMDB_RECOVERY_CHECKPOINT_FAILED",
            RecoveryErrorCode::LogFailed => "STREAMDB_RECOVERY_LOG_FAILED",
            RecoveryErrorCode::IndexFailed => "STREAMDB_RECOVERY_INDEX_FAILED",
            RecoveryErrorCode::IndexAheadOfLog => "STREAMDB_RECOVERY_INDEX_AHEAD_OF_LOG",
            RecoveryErrorCode::ReindexFailed => "STREAMDB_RECOVERY_REINDEX_FAILED",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

#[derive(Debug)]
pub struct RecoveryError {
    code: RecoveryErrorCode,
    message: String,
    cause_code: Option<&'static str>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code.code(), self.message)?;
        if let Some(cause) = self.cause_code {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl RecoveryError {
    fn caused_by(
        code: RecoveryErrorCode,
        message: impl Into<String>,
        cause_code: &'static str,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            cause_code: Some(cause_code),
            source: Some(Box::new(source)),
        }
    }

    pub fn config_invalid(source: ConfigError) -> Self {
        Self {
            code: RecoveryErrorCode::ConfigInvalid,
            message: source.to_string(),
            cause_code: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint_failed(source: CheckpointError) -> Self {
        let cause = source.code().code();
        Self::caused_by(
            RecoveryErrorCode::CheckpointFailed,
            source.message().to_string(),
            cause,
            source,
        )
    }

    pub fn log_failed(source: ChunkError) -> Self {
        let cause = source.code().code();
        Self::caused_by(
            RecoveryErrorCode::LogFailed,
            source.message().to_string(),
            cause,
            source,
        )
    }

    pub fn index_failed(source: IndexError) -> Self {
        let cause = source.code().code();
        Self::caused_by(
            RecoveryErrorCode::IndexFailed,
            source.message().to_string(),
            cause,
            source,
        )
    }

    pub fn index_ahead_of_log(index_checkpoint: i64, writer: i64) -> Self {
        Self {
            code: RecoveryErrorCode::IndexAheadOfLog,
            message: format!(
                "index commit checkpoint {} is beyond the writer checkpoint {}",
                index_checkpoint, writer
            ),
            cause_code: None,
            source: None,
        }
    }

    pub fn reindex_failed(position: i64, source: ReadIndexError) -> Self {
        let cause = source.code();
        Self::caused_by(
            RecoveryErrorCode::ReindexFailed,
            format!("re-indexing failed near log position {}: {}", position, source),
            cause,
            source,
        )
    }

    pub fn code(&self) -> RecoveryErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `STREAMDB_*` code of the subsystem error behind this one
    pub fn cause_code(&self) -> Option<&'static str> {
        self.cause_code
    }

    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl StdError for RecoveryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
