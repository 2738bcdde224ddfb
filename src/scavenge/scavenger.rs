//! One scavenge run over the whole log.
//!
//! 1. Chunk phase: every completed chunk that lies wholly below the chaser
//!    checkpoint, from `start_from_chunk` on, ordered by start then end chunk
//!    number. Worker threads claim chunks from a shared queue.
//! 2. Merge phase (optional): runs of adjacent scavenged chunks whose data
//!    and position maps fit into one chunk are merged.
//! 3. Index phase: the table index drops entries whose record no longer
//!    exists in the log.
//!
//! A failed or cancelled chunk phase ends the run before the index phase, so
//! the index never loses entries because of a chunk that was not swapped in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use crossbeam::channel;
use parking_lot::Mutex;

use super::cancel::CancellationToken;
use super::chunk_scavenger::ChunkScavenger;
use super::errors::{ScavengeError, ScavengeResult};
use super::state::{ScavengeState, ScavengeStatus};
use crate::config::{DbConfig, MAX_SCAVENGE_THREADS};
use crate::index::IndexError;
use crate::observability::{log_event_with_fields, Event, Logger, Timer};
use crate::readindex::ReadIndex;
use crate::tlog::chunk::{Chunk, POS_MAP_SIZE};
use crate::tlog::db::ChunkDb;
use crate::tlog::reader::{LogReader, ReadTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeOptions {
    /// First chunk number to scavenge
    pub start_from_chunk: i32,
    pub threads: usize,
    pub always_keep_scavenged: bool,
    pub merge_chunks: bool,
}

impl ScavengeOptions {
    pub fn from_config(config: &DbConfig) -> Self {
        Self {
            start_from_chunk: 0,
            threads: config.scavenge_threads,
            always_keep_scavenged: config.always_keep_scavenged,
            merge_chunks: config.merge_chunks,
        }
    }
}

impl Default for ScavengeOptions {
    fn default() -> Self {
        Self {
            start_from_chunk: 0,
            threads: 1,
            always_keep_scavenged: false,
            merge_chunks: false,
        }
    }
}

pub struct Scavenger {
    db: Arc<ChunkDb>,
    read_index: Arc<ReadIndex>,
    options: ScavengeOptions,
}

impl Scavenger {
    pub fn new(db: Arc<ChunkDb>, read_index: Arc<ReadIndex>, options: ScavengeOptions) -> Self {
        Self {
            db,
            read_index,
            options,
        }
    }

    /// Run every phase, publishing progress into `status`, and return the
    /// final status. Errors end the run as `Failed` with `last_error` set;
    /// cancellation ends it as `Stopped`.
    pub fn run(&self, status: &Mutex<ScavengeStatus>, cancel: &CancellationToken) -> ScavengeStatus {
        let id = {
            let mut s = status.lock();
            if let Err(e) = s.transition(ScavengeState::Running) {
                s.last_error = Some(e.to_string());
                return s.clone();
            }
            s.id.to_string()
        };
        let timer = Timer::new();
        self.db.metrics().increment_scavenges_started();
        log_event_with_fields(
            Event::ScavengeStarted,
            &[
                ("id", &id),
                ("start_from_chunk", &self.options.start_from_chunk.to_string()),
                ("threads", &self.options.threads.to_string()),
            ],
        );

        let outcome = self.run_phases(status, cancel);

        let mut s = status.lock();
        let (state, event) = match &outcome {
            Ok(()) => (ScavengeState::Completed, Event::ScavengeCompleted),
            Err(e) if e.is_cancelled() => (ScavengeState::Stopped, Event::ScavengeStopped),
            Err(e) => {
                s.last_error = Some(e.to_string());
                (ScavengeState::Failed, Event::ScavengeFailed)
            }
        };
        if let Err(e) = s.transition(state) {
            Logger::error("SCAVENGE_STATE_INVALID", &[("id", &id), ("error", &e.to_string())]);
        }
        log_event_with_fields(
            event,
            &[
                ("id", &id),
                ("chunks", &s.chunks_done.to_string()),
                ("space_saved", &s.space_saved.to_string()),
                ("error", s.last_error.as_deref().unwrap_or("")),
                ("duration_ms", &timer.elapsed_ms()),
            ],
        );
        s.clone()
    }

    fn run_phases(&self, status: &Mutex<ScavengeStatus>, cancel: &CancellationToken) -> ScavengeResult<()> {
        let chunks = self.completed_below_chaser();
        status.lock().total_chunks = chunks.len();

        self.chunk_phase(chunks, status, cancel)?;
        cancel.check()?;
        if self.options.merge_chunks {
            self.merge_phase(status, cancel)?;
        }
        self.index_phase(status, cancel)
    }

    /// Completed chunks wholly below the chaser checkpoint
    fn completed_below_chaser(&self) -> Vec<Arc<Chunk>> {
        let chaser = self.db.checkpoints().chaser.read();
        let mut chunks: Vec<Arc<Chunk>> = self
            .db
            .manager()
            .snapshot_completed()
            .into_iter()
            .filter(|c| c.chunk_end_position() <= chaser)
            .filter(|c| c.chunk_start_number() >= self.options.start_from_chunk)
            .collect();
        chunks.sort_by_key(|c| (c.chunk_start_number(), c.chunk_end_number()));
        chunks
    }

    fn chunk_phase(
        &self,
        chunks: Vec<Arc<Chunk>>,
        status: &Mutex<ScavengeStatus>,
        cancel: &CancellationToken,
    ) -> ScavengeResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let threads = self
            .options
            .threads
            .clamp(1, MAX_SCAVENGE_THREADS)
            .min(chunks.len());

        let (sender, receiver) = channel::unbounded::<Arc<Chunk>>();
        for chunk in chunks {
            if sender.send(chunk).is_err() {
                break;
            }
        }
        drop(sender);

        let now = Utc::now();
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<ScavengeError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        let scavenger = ChunkScavenger::new(
                            &self.db,
                            &self.read_index,
                            now,
                            self.options.always_keep_scavenged,
                        );
                        while let Ok(chunk) = receiver.recv() {
                            if cancel.is_cancelled() || failed.load(Ordering::Acquire) {
                                break;
                            }
                            let (start, end) = (chunk.chunk_start_number(), chunk.chunk_end_number());
                            status.lock().chunk_started(start, end);
                            match scavenger.scavenge_chunk(&chunk, cancel) {
                                Ok(report) => status.lock().chunk_finished(report),
                                Err(e) => {
                                    status.lock().chunk_abandoned(start, end);
                                    if !e.is_cancelled() {
                                        Logger::warn(
                                            "SCAVENGE_CHUNK_FAILED",
                                            &[("chunk", chunk.name()), ("error", &e.to_string())],
                                        );
                                    }
                                    failed.store(true, Ordering::Release);
                                    first_error.lock().get_or_insert(e);
                                    break;
                                }
                            }
                        }
                    })
                })
                .collect();
            for worker in workers {
                if worker.join().is_err() {
                    failed.store(true, Ordering::Release);
                    first_error.lock().get_or_insert(ScavengeError::WorkerPanicked);
                }
            }
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn merge_phase(&self, status: &Mutex<ScavengeStatus>, cancel: &CancellationToken) -> ScavengeResult<()> {
        let candidates: Vec<Arc<Chunk>> = self
            .completed_below_chaser()
            .into_iter()
            .filter(|c| c.is_scavenged())
            .collect();
        let scavenger = ChunkScavenger::new(
            &self.db,
            &self.read_index,
            Utc::now(),
            self.options.always_keep_scavenged,
        );
        for group in plan_merges(&candidates, self.db.chunk_size() as i64) {
            cancel.check()?;
            let report = scavenger.merge_chunks(&group, cancel)?;
            status.lock().merge_finished(report);
        }
        Ok(())
    }

    fn index_phase(&self, status: &Mutex<ScavengeStatus>, cancel: &CancellationToken) -> ScavengeResult<()> {
        cancel.check()?;
        let reader = LogReader::new(Arc::clone(&self.db));
        let tracker = ReadTracker::new("index_scavenge");
        let result = self.read_index.index().scavenge(
            |entry| {
                reader
                    .exists_at(entry.position, &tracker)
                    .map_err(|_| IndexError::dangling_entry(entry.stream, entry.version, entry.position))
            },
            || cancel.is_cancelled(),
        )?;
        status.lock().index_result = Some(result);
        Ok(())
    }
}

/// Group adjacent chunks whose data and position maps fit into one chunk.
/// Only groups of two or more are returned.
fn plan_merges(chunks: &[Arc<Chunk>], chunk_size: i64) -> Vec<Vec<Arc<Chunk>>> {
    let mut groups = Vec::new();
    let mut current: Vec<Arc<Chunk>> = Vec::new();
    let mut size = 0i64;

    for chunk in chunks {
        let needed = merged_size(chunk);
        let adjacent = current
            .last()
            .is_some_and(|last| last.chunk_end_number() + 1 == chunk.chunk_start_number());
        if !adjacent || size + needed > chunk_size {
            if current.len() > 1 {
                groups.push(std::mem::take(&mut current));
            }
            current.clear();
            size = 0;
        }
        if needed <= chunk_size {
            current.push(Arc::clone(chunk));
            size += needed;
        }
    }
    if current.len() > 1 {
        groups.push(current);
    }
    groups
}

fn merged_size(chunk: &Chunk) -> i64 {
    chunk.physical_data_size() + (chunk.pos_map().len() * POS_MAP_SIZE) as i64
}
