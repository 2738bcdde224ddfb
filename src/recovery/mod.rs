//! Recovery
//!
//! Brings the log, the checkpoints and the index back into agreement before
//! the store serves anything. The log is the source of truth: chunk files
//! are validated against the writer checkpoint and the index is caught up by
//! replaying the log from its own commit checkpoint.
//!
//! # Invariants
//!
//! - No dependent checkpoint is ahead of the writer checkpoint
//! - The index commit checkpoint is not ahead of the writer checkpoint
//! - After recovery the chaser and index checkpoints equal the writer checkpoint

mod errors;
mod startup;

pub use errors::{RecoveryError, RecoveryErrorCode, RecoveryResult, Severity};
pub use startup::{recover, recover_with_hasher, Recovered, RecoveryStats};
