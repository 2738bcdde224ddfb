//! Stream index
//!
//! Maps `(stream hash, event number)` to the log position of the event.
//!
//! # Design Principles
//!
//! - Derived state: the log is the source of truth, the index can always be
//!   rebuilt from it
//! - Tables are immutable once written and replaced as a whole
//! - Hashes collide: lookups return candidates, the read index confirms them
//!   against the record's stream id
//!
//! # Invariants
//!
//! - A published table set is always persisted first
//! - The index commit checkpoint never passes the writer checkpoint

mod entry;
mod errors;
mod hasher;
mod index_map;
mod memtable;
mod ptable;
mod table_index;

pub use entry::{sort_for_table, IndexEntry};
pub use errors::{IndexError, IndexErrorCode, IndexResult, Severity};
pub use hasher::{StreamHasher, Xxh3Hasher};
pub use index_map::{IndexMap, INDEX_MAP_FILE};
pub use memtable::MemTable;
pub use ptable::PTable;
pub use table_index::{IndexRange, IndexScavengeResult, TableIndex, TableIndexOptions};
