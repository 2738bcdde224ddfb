//! streamdb - chunked transaction log, stream index and online scavenger
//!
//! The log is the source of truth. Everything else (the stream index, the
//! chaser and index checkpoints) is derived from it and rebuilt from it on
//! startup.
//!
//! ```text
//! Store ──► tlog (LogWriter, chunks, ChunkDb) ──► checkpoint
//!   │           ▲
//!   ├──► readindex ──► index (TableIndex)
//!   └──► scavenge ───► tlog + index
//! ```

pub mod checkpoint;
pub mod config;
pub mod crash_point;
pub mod index;
pub mod observability;
pub mod readindex;
pub mod recovery;
pub mod scavenge;
pub mod store;
pub mod tlog;

pub use config::DbConfig;
pub use store::{EventData, Store, StoreError, StoreResult, WriteResult};
