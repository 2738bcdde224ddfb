//! Crash point injection for durability testing
//!
//! When `STREAMDB_CRASH_POINT` names a point reached by the running process,
//! the process aborts immediately. No unwinding, no destructors, no flush.
//! Integration tests run a child process with the variable set and then
//! reopen the data directory to check what survived.
//!
//! ```bash
//! STREAMDB_CRASH_POINT=writer_after_chunk_flush cargo test ...
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn configured_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("STREAMDB_CRASH_POINT").ok())
        .as_deref()
}

/// Returns true if `STREAMDB_CRASH_POINT` equals the given name.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    configured_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if the named crash point is enabled.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Writer
    pub const WRITER_AFTER_APPEND: &str = "writer_after_append";
    pub const WRITER_AFTER_CHUNK_FLUSH: &str = "writer_after_chunk_flush";
    pub const WRITER_AFTER_CHECKPOINT_FLUSH: &str = "writer_after_checkpoint_flush";

    // Chunk completion
    pub const CHUNK_BEFORE_FOOTER: &str = "chunk_before_footer";
    pub const CHUNK_AFTER_FOOTER: &str = "chunk_after_footer";

    // Scavenge swap
    pub const SWAP_BEFORE_RENAME: &str = "swap_before_rename";
    pub const SWAP_AFTER_RENAME: &str = "swap_after_rename";

    // Index
    pub const INDEX_BEFORE_MAP_RENAME: &str = "index_before_map_rename";
    pub const INDEX_AFTER_MAP_RENAME: &str = "index_after_map_rename";

    // Chaser
    pub const CHASER_BEFORE_CHECKPOINT: &str = "chaser_before_checkpoint";

    pub fn all() -> &'static [&'static str] {
        &[
            WRITER_AFTER_APPEND,
            WRITER_AFTER_CHUNK_FLUSH,
            WRITER_AFTER_CHECKPOINT_FLUSH,
            CHUNK_BEFORE_FOOTER,
            CHUNK_AFTER_FOOTER,
            SWAP_BEFORE_RENAME,
            SWAP_AFTER_RENAME,
            INDEX_BEFORE_MAP_RENAME,
            INDEX_AFTER_MAP_RENAME,
            CHASER_BEFORE_CHECKPOINT,
        ]
    }
}
