//! Transaction log
//!
//! An append-only log split into fixed-size chunk files. Global position
//! `p` lives in chunk `p / chunk_size` at local offset `p % chunk_size`.
//!
//! ```text
//! LogWriter ──► writable Chunk ──► complete() ──► immutable Chunk
//!                                                     │
//!                          scavenge ─► swap_chunk ────┘ (new version)
//! ```
//!
//! # Durability
//!
//! Chunk data is fsynced before the writer checkpoint is flushed, and readers
//! never look past the flushed writer checkpoint.

pub mod buffer_pool;
pub mod chaser;
pub mod chunk;
pub mod db;
pub mod errors;
pub mod manager;
pub mod naming;
pub mod reader;
pub mod record;
pub mod writer;

pub use chaser::LogChaser;
pub use chunk::{AppendResult, Chunk, ChunkOptions, RecordReadResult};
pub use db::ChunkDb;
pub use errors::{ChunkError, ChunkErrorCode, ChunkResult};
pub use manager::ChunkManager;
pub use naming::ChunkNaming;
pub use reader::{LogReader, ReadTracker, SeqReadResult, SeqReader};
pub use record::{
    CodecError, CommitRecord, LogRecord, PartitionTypeRecord, PrepareFlags, PrepareRecord,
    RecordType, StreamTypeRecord, SystemRecord,
};
pub use writer::{LogWriter, RecordWritten};
