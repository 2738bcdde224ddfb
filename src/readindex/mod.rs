//! Stream-level reads over the log and the index
//!
//! # Design Principles
//!
//! - The index is a hint: every candidate is confirmed by reading the record
//! - Stream metadata lives in the log as events of the stream's metastream
//! - Deletion is data: a hard delete is a tombstone prepare, a soft delete is
//!   a metadata event with `$tb` set to [`DELETED_STREAM`](crate::tlog::record::DELETED_STREAM)

pub mod committer;
mod errors;
pub mod index_reader;
pub mod metadata;
pub mod streams;

pub use committer::IndexCommitter;
pub use errors::{ReadIndexError, ReadIndexResult};
pub use index_reader::{EventRecord, ReadEventResult, ReadIndex, ReadStatus, StreamSlice};
pub use metadata::StreamMetadata;
pub use streams::{event_types, SystemStreams};
