//! Scavenge run state machine and progress reporting.
//!
//! ```text
//! Idle ──► Running ──► Completed
//!             ├──────► Failed
//!             └──────► Stopped
//! ```
//!
//! Terminal states are final; a new run starts from a new status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::errors::{ScavengeError, ScavengeResult};
use crate::index::IndexScavengeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScavengeState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ScavengeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScavengeState::Idle => "IDLE",
            ScavengeState::Running => "RUNNING",
            ScavengeState::Completed => "COMPLETED",
            ScavengeState::Failed => "FAILED",
            ScavengeState::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScavengeState::Completed | ScavengeState::Failed | ScavengeState::Stopped
        )
    }

    pub fn can_transition_to(&self, to: ScavengeState) -> bool {
        matches!(
            (self, to),
            (ScavengeState::Idle, ScavengeState::Running)
                | (ScavengeState::Running, ScavengeState::Completed)
                | (ScavengeState::Running, ScavengeState::Failed)
                | (ScavengeState::Running, ScavengeState::Stopped)
        )
    }
}

impl fmt::Display for ScavengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of scavenging (or merging) one chunk range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkScavengeReport {
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub kept: u64,
    pub discarded: u64,
    /// Bytes reclaimed; zero when the new chunk was not swapped in
    pub space_saved: i64,
    pub swapped: bool,
    pub elapsed_ms: u64,
}

/// Snapshot of one scavenge run
#[derive(Debug, Clone, Serialize)]
pub struct ScavengeStatus {
    pub id: Uuid,
    pub state: ScavengeState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_chunks: usize,
    pub chunks_done: usize,
    /// `(start, end)` chunk numbers of chunks in progress
    pub current_chunks: Vec<(i32, i32)>,
    pub chunks: Vec<ChunkScavengeReport>,
    pub merges: Vec<ChunkScavengeReport>,
    pub space_saved: i64,
    #[serde(skip)]
    pub index_result: Option<IndexScavengeResult>,
    pub last_error: Option<String>,
}

impl ScavengeStatus {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ScavengeState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            total_chunks: 0,
            chunks_done: 0,
            current_chunks: Vec::new(),
            chunks: Vec::new(),
            merges: Vec::new(),
            space_saved: 0,
            index_result: None,
            last_error: None,
        }
    }

    pub fn transition(&mut self, to: ScavengeState) -> ScavengeResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(ScavengeError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to == ScavengeState::Running {
            self.started_at = Utc::now();
        }
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.current_chunks.clear();
        }
        Ok(())
    }

    /// Share of the chunk phase done, 0 to 100
    pub fn percent_complete(&self) -> f64 {
        if self.state == ScavengeState::Completed {
            return 100.0;
        }
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.chunks_done as f64 * 100.0 / self.total_chunks as f64
    }

    pub(crate) fn chunk_started(&mut self, start: i32, end: i32) {
        self.current_chunks.push((start, end));
    }

    pub(crate) fn chunk_finished(&mut self, report: ChunkScavengeReport) {
        self.current_chunks
            .retain(|&c| c != (report.chunk_start_number, report.chunk_end_number));
        self.chunks_done += 1;
        self.space_saved += report.space_saved;
        self.chunks.push(report);
    }

    pub(crate) fn chunk_abandoned(&mut self, start: i32, end: i32) {
        self.current_chunks.retain(|&c| c != (start, end));
    }

    pub(crate) fn merge_finished(&mut self, report: ChunkScavengeReport) {
        self.space_saved += report.space_saved;
        self.merges.push(report);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for ScavengeStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(start: i32, saved: i64) -> ChunkScavengeReport {
        ChunkScavengeReport {
            chunk_start_number: start,
            chunk_end_number: start,
            kept: 1,
            discarded: 2,
            space_saved: saved,
            swapped: saved > 0,
            elapsed_ms: 0,
        }
    }

    #[test]
    fn test_valid_transitions() {
        let mut status = ScavengeStatus::new();
        status.transition(ScavengeState::Running).unwrap();
        status.transition(ScavengeState::Completed).unwrap();
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [ScavengeState::Completed, ScavengeState::Failed, ScavengeState::Stopped] {
            let mut status = ScavengeStatus::new();
            status.transition(ScavengeState::Running).unwrap();
            status.transition(terminal).unwrap();
            assert!(matches!(
                status.transition(ScavengeState::Running),
                Err(ScavengeError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_idle_cannot_complete() {
        let mut status = ScavengeStatus::new();
        assert!(status.transition(ScavengeState::Completed).is_err());
        assert_eq!(status.state, ScavengeState::Idle);
    }

    #[test]
    fn test_progress() {
        let mut status = ScavengeStatus::new();
        status.transition(ScavengeState::Running).unwrap();
        status.total_chunks = 4;
        status.chunk_started(0, 0);
        assert_eq!(status.current_chunks, vec![(0, 0)]);
        status.chunk_finished(report(0, 100));
        status.chunk_finished(report(1, 0));
        assert!(status.current_chunks.is_empty());
        assert_eq!(status.percent_complete(), 50.0);
        assert_eq!(status.space_saved, 100);
        assert!(status.to_json().contains("\"state\":\"Running\""));
    }
}
