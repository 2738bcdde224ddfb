//! Lifecycle events emitted by the log, index and scavenger.
//!
//! Events are explicit and typed. The string form is what appears in the
//! `event` key of every structured log line.

use std::fmt;

/// Observable events in streamdb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Startup & shutdown
    /// Store open begins
    StoreOpenBegin,
    /// Store open complete, ready to serve
    StoreOpenComplete,
    /// Store closed
    StoreClosed,
    /// Configuration loaded
    ConfigLoaded,

    // Chunk lifecycle
    /// New chunk file created
    ChunkCreated,
    /// Chunk sealed with footer and hash
    ChunkCompleted,
    /// Scavenged chunk swapped in place of older versions
    ChunkSwapped,
    /// Chunk file removed after its last reader lease was released
    ChunkDeleted,
    /// Temp or superseded chunk file removed during startup
    ChunkFileRemoved,
    /// Chunk hash or frame corruption detected (FATAL)
    ChunkCorruption,

    // Writer & checkpoints
    /// Writer flushed data and advanced its checkpoint
    WriterFlush,
    /// Epoch record written
    EpochWritten,

    // Index
    /// MemTable flushed to a PTable
    IndexFlush,
    /// PTables merged into the next level
    IndexMerge,
    /// Index map persisted
    IndexMapSaved,
    /// Index tables rebuilt by scavenge
    IndexScavenged,
    /// Index corruption detected (FATAL)
    IndexCorruption,

    // Scavenge
    /// Scavenge run started
    ScavengeStarted,
    /// One chunk (or range) finished scavenging
    ScavengeChunkComplete,
    /// Chunk merge phase finished
    ScavengeMergeComplete,
    /// Scavenge run completed
    ScavengeCompleted,
    /// Scavenge run stopped by request
    ScavengeStopped,
    /// Scavenge run failed
    ScavengeFailed,

    // Recovery
    /// Recovery started
    RecoveryStart,
    /// Chunk database validated
    RecoveryChunksValidated,
    /// Index catch-up replay begins
    RecoveryReindexBegin,
    /// Index catch-up replay complete
    RecoveryReindexComplete,
    /// Recovery complete
    RecoveryComplete,
    /// Recovery failed (FATAL)
    RecoveryFailed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StoreOpenBegin => "STORE_OPEN_BEGIN",
            Event::StoreOpenComplete => "STORE_OPEN_COMPLETE",
            Event::StoreClosed => "STORE_CLOSED",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::ChunkCreated => "CHUNK_CREATED",
            Event::ChunkCompleted => "CHUNK_COMPLETED",
            Event::ChunkSwapped => "CHUNK_SWAPPED",
            Event::ChunkDeleted => "CHUNK_DELETED",
            Event::ChunkFileRemoved => "CHUNK_FILE_REMOVED",
            Event::ChunkCorruption => "CHUNK_CORRUPTION",

            Event::WriterFlush => "WRITER_FLUSH",
            Event::EpochWritten => "EPOCH_WRITTEN",

            Event::IndexFlush => "INDEX_FLUSH",
            Event::IndexMerge => "INDEX_MERGE",
            Event::IndexMapSaved => "INDEX_MAP_SAVED",
            Event::IndexScavenged => "INDEX_SCAVENGED",
            Event::IndexCorruption => "INDEX_CORRUPTION",

            Event::ScavengeStarted => "SCAVENGE_STARTED",
            Event::ScavengeChunkComplete => "SCAVENGE_CHUNK_COMPLETE",
            Event::ScavengeMergeComplete => "SCAVENGE_MERGE_COMPLETE",
            Event::ScavengeCompleted => "SCAVENGE_COMPLETED",
            Event::ScavengeStopped => "SCAVENGE_STOPPED",
            Event::ScavengeFailed => "SCAVENGE_FAILED",

            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryChunksValidated => "RECOVERY_CHUNKS_VALIDATED",
            Event::RecoveryReindexBegin => "RECOVERY_REINDEX_BEGIN",
            Event::RecoveryReindexComplete => "RECOVERY_REINDEX_COMPLETE",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::ChunkCorruption | Event::IndexCorruption | Event::RecoveryFailed
        )
    }

    /// Returns true if this event should be logged at WARN
    pub fn is_warning(&self) -> bool {
        matches!(self, Event::ScavengeFailed | Event::ChunkFileRemoved)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
