//! Control surface for background scavenges: start, stop, status, history.
//!
//! At most one run is active at a time. Each run gets its own thread, status
//! and cancellation token; finished runs move into the history.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use uuid::Uuid;

use super::cancel::CancellationToken;
use super::errors::{ScavengeError, ScavengeResult};
use super::scavenger::{ScavengeOptions, Scavenger};
use super::state::ScavengeStatus;
use crate::observability::Logger;
use crate::readindex::ReadIndex;
use crate::tlog::db::ChunkDb;

const MAX_HISTORY: usize = 32;

struct RunningScavenge {
    id: Uuid,
    status: Arc<Mutex<ScavengeStatus>>,
    cancel: CancellationToken,
    handle: JoinHandle<ScavengeStatus>,
}

pub struct ScavengeService {
    db: Arc<ChunkDb>,
    read_index: Arc<ReadIndex>,
    defaults: ScavengeOptions,
    current: Mutex<Option<RunningScavenge>>,
    history: Mutex<Vec<ScavengeStatus>>,
}

impl ScavengeService {
    pub fn new(db: Arc<ChunkDb>, read_index: Arc<ReadIndex>, defaults: ScavengeOptions) -> Self {
        Self {
            db,
            read_index,
            defaults,
            current: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn defaults(&self) -> ScavengeOptions {
        self.defaults
    }

    /// Start a run in the background and return its id
    pub fn start(&self, options: ScavengeOptions) -> ScavengeResult<Uuid> {
        let mut current = self.current.lock();
        if let Some(run) = current.as_ref() {
            if !run.handle.is_finished() {
                return Err(ScavengeError::AlreadyRunning(run.id));
            }
        }
        if let Some(run) = current.take() {
            self.finish(run)?;
        }

        let status = Arc::new(Mutex::new(ScavengeStatus::new()));
        let id = status.lock().id;
        let cancel = CancellationToken::new();
        let scavenger = Scavenger::new(Arc::clone(&self.db), Arc::clone(&self.read_index), options);

        let handle = {
            let status = Arc::clone(&status);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("scavenger".to_string())
                .spawn(move || scavenger.run(&status, &cancel))
                .map_err(ScavengeError::Spawn)?
        };

        *current = Some(RunningScavenge {
            id,
            status,
            cancel,
            handle,
        });
        Ok(id)
    }

    /// Ask the running scavenge to stop after the record it is processing
    pub fn stop(&self) -> ScavengeResult<Uuid> {
        let current = self.current.lock();
        match current.as_ref() {
            Some(run) if !run.handle.is_finished() => {
                run.cancel.cancel();
                Logger::info("SCAVENGE_STOP_REQUESTED", &[("id", &run.id.to_string())]);
                Ok(run.id)
            }
            _ => Err(ScavengeError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Status of the current run, or of the last finished one
    pub fn status(&self) -> Option<ScavengeStatus> {
        if let Some(run) = self.current.lock().as_ref() {
            return Some(run.status.lock().clone());
        }
        self.history.lock().last().cloned()
    }

    /// Block until the current run ends and return its final status
    pub fn wait(&self) -> ScavengeResult<ScavengeStatus> {
        let run = self.current.lock().take().ok_or(ScavengeError::NotRunning)?;
        self.finish(run)
    }

    /// Finished runs, oldest first
    pub fn history(&self) -> Vec<ScavengeStatus> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|run| run.handle.is_finished()) {
            if let Some(run) = current.take() {
                if let Err(e) = self.finish(run) {
                    Logger::error("SCAVENGE_JOIN_FAILED", &[("error", &e.to_string())]);
                }
            }
        }
        drop(current);
        self.history.lock().clone()
    }

    fn finish(&self, run: RunningScavenge) -> ScavengeResult<ScavengeStatus> {
        let status = run
            .handle
            .join()
            .map_err(|_| ScavengeError::WorkerPanicked)?;
        let mut history = self.history.lock();
        history.push(status.clone());
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        Ok(status)
    }
}

impl Drop for ScavengeService {
    fn drop(&mut self) {
        if let Some(run) = self.current.get_mut().take() {
            run.cancel.cancel();
            let _ = run.handle.join();
        }
    }
}
