//! Online compaction of completed chunks
//!
//! # Design Principles
//!
//! - Never mutate in place: survivors go to a new chunk that is swapped in
//!   whole, or thrown away
//! - Retention is decided from the stream's current state in the read index
//! - Cooperative cancellation, polled after every record
//! - The index is only scavenged after a chunk phase that fully succeeded
//!
//! # Invariants
//!
//! - Only chunks wholly below the chaser checkpoint are touched
//! - Every surviving record keeps its log position and is reachable through
//!   the new chunk's position map

mod cancel;
mod chunk_scavenger;
mod errors;
mod policy;
mod scavenger;
mod service;
mod state;

pub use cancel::CancellationToken;
pub use chunk_scavenger::ChunkScavenger;
pub use errors::{ScavengeError, ScavengeResult};
pub use policy::{gather_commit, CommitInfo, CommitInfos, RetentionPolicy};
pub use scavenger::{ScavengeOptions, Scavenger};
pub use service::ScavengeService;
pub use state::{ChunkScavengeReport, ScavengeState, ScavengeStatus};
