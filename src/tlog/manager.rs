//! Ordered set of chunks, addressed by chunk number.
//!
//! Slot `n` holds the chunk that covers chunk number `n`. A scavenged chunk
//! that merged numbers `a..=b` occupies every slot in that range. Slots are
//! only ever replaced as a whole range under the write lock, so a reader
//! resolving a position sees either the old chunk set or the new one.

use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event};
use crate::tlog::chunk::{sync_parent_dir, Chunk, ChunkOptions};
use crate::tlog::errors::{ChunkError, ChunkResult};
use crate::tlog::naming::ChunkNaming;

pub struct ChunkManager {
    chunk_size: i32,
    naming: ChunkNaming,
    options: ChunkOptions,
    slots: RwLock<Vec<Arc<Chunk>>>,
}

impl ChunkManager {
    pub fn new(chunk_size: i32, naming: ChunkNaming, options: ChunkOptions) -> Self {
        Self {
            chunk_size,
            naming,
            options,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    pub fn naming(&self) -> &ChunkNaming {
        &self.naming
    }

    pub fn options(&self) -> &ChunkOptions {
        &self.options
    }

    /// Number of chunk numbers covered, i.e. the next chunk number
    pub fn chunks_count(&self) -> i32 {
        self.slots.read().len() as i32
    }

    pub fn get_chunk(&self, number: i32) -> ChunkResult<Arc<Chunk>> {
        self.try_get_chunk(number).ok_or_else(|| {
            ChunkError::invariant(format!(
                "chunk #{} requested, {} chunks present",
                number,
                self.chunks_count()
            ))
        })
    }

    pub fn try_get_chunk(&self, number: i32) -> Option<Arc<Chunk>> {
        if number < 0 {
            return None;
        }
        self.slots.read().get(number as usize).cloned()
    }

    /// Chunk holding global logical `position`
    pub fn get_chunk_for(&self, position: i64) -> ChunkResult<Arc<Chunk>> {
        if position < 0 {
            return Err(ChunkError::invariant(format!(
                "negative log position {}",
                position
            )));
        }
        let number = position / self.chunk_size as i64;
        if number > i32::MAX as i64 {
            return Err(ChunkError::invariant(format!(
                "log position {} is beyond the addressable chunk range",
                position
            )));
        }
        self.get_chunk(number as i32)
    }

    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.slots.read().last().cloned()
    }

    /// Register an opened chunk; it must start at the next free number
    pub fn add_chunk(&self, chunk: Arc<Chunk>) -> ChunkResult<()> {
        let mut slots = self.slots.write();
        let next = slots.len() as i32;
        if chunk.chunk_start_number() != next {
            return Err(ChunkError::invariant(format!(
                "chunk {} starts at #{}, expected #{}",
                chunk.name(),
                chunk.chunk_start_number(),
                next
            )));
        }
        for _ in chunk.chunk_start_number()..=chunk.chunk_end_number() {
            slots.push(Arc::clone(&chunk));
        }
        Ok(())
    }

    /// Create the next writable chunk, version 0.
    pub fn add_new_chunk(&self) -> ChunkResult<Arc<Chunk>> {
        let mut slots = self.slots.write();
        if let Some(last) = slots.last() {
            if !last.is_completed() {
                return Err(ChunkError::invariant(format!(
                    "cannot add a chunk while {} is still writable",
                    last.name()
                )));
            }
        }
        let number = slots.len() as i32;
        let path = self.naming.file_name_for(number, 0);
        let chunk = Arc::new(Chunk::create_new(
            &path,
            self.chunk_size,
            number,
            number,
            false,
            &self.options,
        )?);
        slots.push(Arc::clone(&chunk));
        Ok(chunk)
    }

    /// A scavenged chunk under construction, written to a temporary file
    pub fn create_temp_chunk(&self, start: i32, end: i32) -> ChunkResult<Chunk> {
        let options = ChunkOptions {
            memory_map: false,
            ..self.options.clone()
        };
        Chunk::create_new(
            &self.naming.temp_file_name(),
            self.chunk_size,
            start,
            end,
            true,
            &options,
        )
    }

    /// Replace the chunks covered by `new_chunk` with it.
    ///
    /// The completed temporary file is renamed to the next version of its
    /// first chunk number and reopened. Every slot in its range is replaced
    /// under the write lock, and the replaced chunks are marked for deletion.
    /// Their files disappear once their last reader lease is released.
    pub fn swap_chunk(&self, new_chunk: Chunk) -> ChunkResult<Arc<Chunk>> {
        if !new_chunk.is_completed() {
            return Err(ChunkError::invariant(format!(
                "chunk {} must be completed before it is swapped in",
                new_chunk.name()
            )));
        }
        let start = new_chunk.chunk_start_number();
        let end = new_chunk.chunk_end_number();

        let mut slots = self.slots.write();
        if end as usize >= slots.len() {
            return Err(ChunkError::invariant(format!(
                "swap range #{}-#{} is beyond the {} chunks present",
                start,
                end,
                slots.len()
            )));
        }

        let mut replaced: Vec<Arc<Chunk>> = Vec::new();
        for slot in &slots[start as usize..=end as usize] {
            if slot.chunk_start_number() < start || slot.chunk_end_number() > end {
                return Err(ChunkError::invariant(format!(
                    "chunk {} straddles swap range #{}-#{}",
                    slot.name(),
                    start,
                    end
                )));
            }
            if !slot.is_completed() {
                return Err(ChunkError::invariant(format!(
                    "chunk {} is still writable and cannot be replaced",
                    slot.name()
                )));
            }
            if !replaced.iter().any(|c| Arc::ptr_eq(c, slot)) {
                replaced.push(Arc::clone(slot));
            }
        }

        let version = self.next_version(start, &slots[start as usize])?;
        let new_path = self.naming.file_name_for(start, version);

        let installed = if new_chunk.is_in_memory() {
            new_chunk.relocated(new_path)
        } else {
            let temp_path = new_chunk.path().to_path_buf();
            drop(new_chunk);

            maybe_crash(points::SWAP_BEFORE_RENAME);
            fs::rename(&temp_path, &new_path).map_err(|e| {
                ChunkError::io_failed(
                    format!(
                        "Failed to rename {} to {}",
                        temp_path.display(),
                        new_path.display()
                    ),
                    e,
                )
            })?;
            sync_parent_dir(&new_path)?;
            maybe_crash(points::SWAP_AFTER_RENAME);

            Chunk::open_completed(&new_path, false, &self.options)?
        };

        let installed = Arc::new(installed);
        for slot in &mut slots[start as usize..=end as usize] {
            *slot = Arc::clone(&installed);
        }
        drop(slots);

        for old in &replaced {
            old.mark_for_deletion();
        }
        self.options.metrics.increment_chunks_swapped();
        log_event_with_fields(
            Event::ChunkSwapped,
            &[
                ("chunk", installed.name()),
                ("replaced", &replaced.len().to_string()),
                ("start", &start.to_string()),
                ("end", &end.to_string()),
            ],
        );
        Ok(installed)
    }

    fn next_version(&self, start: i32, current: &Chunk) -> ChunkResult<i32> {
        let in_use = self
            .naming
            .parse(current.name())
            .map(|(_, v)| v)
            .unwrap_or(0);
        let on_disk = if self.options.in_memory {
            None
        } else {
            self.naming.determine_best_version(start).map_err(|e| {
                ChunkError::io_failed(format!("Failed to list versions of chunk #{}", start), e)
            })?
        };
        Ok(in_use.max(on_disk.unwrap_or(0)) + 1)
    }

    /// Distinct chunks in number order
    pub fn all_chunks(&self) -> Vec<Arc<Chunk>> {
        let slots = self.slots.read();
        let mut out: Vec<Arc<Chunk>> = Vec::new();
        for chunk in slots.iter() {
            if out.last().map(|c| Arc::ptr_eq(c, chunk)).unwrap_or(false) {
                continue;
            }
            out.push(Arc::clone(chunk));
        }
        out
    }

    /// Distinct completed chunks in number order
    pub fn snapshot_completed(&self) -> Vec<Arc<Chunk>> {
        self.all_chunks()
            .into_iter()
            .filter(|c| c.is_completed())
            .collect()
    }
}
