//! Chunk: one segment file of the transaction log.
//!
//! # Layout
//!
//! ```text
//! header (128) | data | position map (scavenged only) | footer (128)
//! ```
//!
//! Each record in the data region is framed as
//! `[len u32][body][crc32 u32][len u32]`, so the log can be walked in both
//! directions and a torn write is detected by the length suffix or checksum.
//!
//! # Positions
//!
//! Positions passed to and returned from a chunk are local: relative to the
//! chunk's first logical position. For an ordinary chunk the local logical
//! position is also the offset in the data region. A scavenged chunk keeps
//! only some records, so reads first resolve the logical position to an
//! actual offset through the position map.
//!
//! # Lifecycle
//!
//! A new chunk is writable by a single writer until `complete()` (or
//! `complete_scavenged()`) writes the footer and content hash. From then on
//! it is immutable and, when configured, memory mapped.

pub mod footer;
pub mod header;
pub mod posmap;
pub mod readers;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::tlog::errors::{codec_error, ChunkError, ChunkResult};
use crate::tlog::record::LogRecord;

pub use footer::{ChunkFooter, FOOTER_SIZE};
pub use header::{ChunkHeader, HEADER_SIZE};
pub use posmap::{PosMap, PosMapTable, POS_MAP_SIZE};
pub use readers::{ReaderLease, ReaderPool, ReaderPoolConfig};

/// Length prefix + checksum + length suffix
pub const FRAME_OVERHEAD: i64 = 12;

const HEADER_LEN: u64 = HEADER_SIZE as u64;
const HASH_BLOCK: usize = 64 * 1024;

#[derive(Clone)]
pub struct ChunkOptions {
    /// Keep the chunk in a memory buffer instead of a file
    pub in_memory: bool,
    /// Memory map the chunk once it is completed
    pub memory_map: bool,
    pub reader_pool: ReaderPoolConfig,
    pub metrics: Arc<MetricsRegistry>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            in_memory: false,
            memory_map: true,
            reader_pool: ReaderPoolConfig::default(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Record written between these local (actual) positions
    Written { old_position: i64, new_position: i64 },
    /// Not enough room left; nothing was written
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReadResult {
    pub record: LogRecord,
    /// Local logical position to continue from: the next record for
    /// forward reads, the start of this record for backward reads
    pub next_position: i64,
    /// Length of the record body
    pub record_length: i32,
}

enum Storage {
    File,
    /// Whole file image: header, data, map and footer
    Memory(RwLock<Vec<u8>>),
}

struct WriterState {
    file: Option<File>,
    hasher: Sha256,
    /// Local logical end of the last appended record
    logical_end: i64,
}

pub struct Chunk {
    path: PathBuf,
    name: String,
    header: ChunkHeader,
    options: ChunkOptions,
    storage: Storage,
    mmap: OnceLock<Mmap>,
    footer: OnceLock<ChunkFooter>,
    pos_map: OnceLock<PosMapTable>,
    writer: Mutex<Option<WriterState>>,
    physical_size: AtomicI64,
    logical_size: AtomicI64,
    readers: ReaderPool,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// fsync the directory holding `path`
pub(crate) fn sync_parent_dir(path: &Path) -> ChunkResult<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent).map_err(|e| {
            ChunkError::io_failed(format!("Failed to open directory: {}", parent.display()), e)
        })?;
        dir.sync_all().map_err(|e| {
            ChunkError::fsync_failed(
                format!("fsync failed for directory: {}", parent.display()),
                e,
            )
        })?;
    }
    Ok(())
}

impl Chunk {
    /// Create a new writable chunk covering chunk numbers `start..=end`.
    ///
    /// Ordinary chunks are preallocated to their full size. Scavenged chunks
    /// are written to a temporary file and only grow as records survive.
    pub fn create_new(
        path: &Path,
        chunk_size: i32,
        start: i32,
        end: i32,
        scavenged: bool,
        options: &ChunkOptions,
    ) -> ChunkResult<Self> {
        let name = display_name(path);
        let header = ChunkHeader::new(chunk_size, start, end, scavenged);
        let header_bytes = header.to_bytes();
        let mut hasher = Sha256::new();
        hasher.update(header_bytes);

        let (storage, file, pool_path) = if options.in_memory {
            let mut image = Vec::with_capacity(HEADER_SIZE + 4096);
            image.extend_from_slice(&header_bytes);
            (Storage::Memory(RwLock::new(image)), None, None)
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    ChunkError::io_failed(format!("Failed to create chunk: {}", path.display()), e)
                })?;
            file.write_all(&header_bytes).map_err(|e| {
                ChunkError::io_failed(format!("Failed to write chunk header: {}", name), e)
            })?;
            if !scavenged {
                let full = HEADER_LEN + header.logical_capacity() as u64 + FOOTER_SIZE as u64;
                file.set_len(full).map_err(|e| {
                    ChunkError::io_failed(format!("Failed to preallocate chunk: {}", name), e)
                })?;
            }
            file.sync_all()
                .map_err(|e| ChunkError::fsync_failed(format!("fsync failed for {}", name), e))?;
            sync_parent_dir(path)?;
            (Storage::File, Some(file), Some(path.to_path_buf()))
        };

        let readers = ReaderPool::new(
            &name,
            pool_path,
            options.reader_pool,
            Arc::clone(&options.metrics),
        )?;

        log_event_with_fields(
            Event::ChunkCreated,
            &[
                ("chunk", &name),
                ("start", &start.to_string()),
                ("end", &end.to_string()),
                ("scavenged", if scavenged { "true" } else { "false" }),
            ],
        );

        Ok(Self {
            path: path.to_path_buf(),
            name,
            header,
            options: options.clone(),
            storage,
            mmap: OnceLock::new(),
            footer: OnceLock::new(),
            pos_map: OnceLock::new(),
            writer: Mutex::new(Some(WriterState {
                file,
                hasher,
                logical_end: 0,
            })),
            physical_size: AtomicI64::new(0),
            logical_size: AtomicI64::new(0),
            readers,
        })
    }

    /// Open a completed, read-only chunk file.
    ///
    /// # Errors
    ///
    /// - `STREAMDB_CHUNK_BAD_VERSION` for an unknown header or map format
    /// - `STREAMDB_CHUNK_CORRUPTED` if the footer is missing or sizes disagree
    /// - `STREAMDB_CHUNK_HASH_MISMATCH` if `verify_hash` is set and the hash differs
    pub fn open_completed(path: &Path, verify_hash: bool, options: &ChunkOptions) -> ChunkResult<Self> {
        let name = display_name(path);
        let mut file = File::open(path).map_err(|e| {
            ChunkError::io_failed(format!("Failed to open chunk: {}", path.display()), e)
        })?;
        let len = file
            .metadata()
            .map_err(|e| ChunkError::io_failed(format!("Failed to stat chunk: {}", name), e))?
            .len();
        if len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(ChunkError::corrupted(
                &name,
                format!("file is {} bytes, too small for header and footer", len),
            ));
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        read_exact_at(&mut file, 0, &mut header_buf, &name)?;
        let header = ChunkHeader::from_bytes(&name, &header_buf)?;

        let mut footer_buf = [0u8; FOOTER_SIZE];
        read_exact_at(&mut file, len - FOOTER_SIZE as u64, &mut footer_buf, &name)?;
        let footer = ChunkFooter::from_bytes(&name, &footer_buf)?;
        if !footer.is_completed {
            return Err(ChunkError::corrupted(&name, "footer is not marked completed"));
        }

        let expected = HEADER_LEN
            + footer.physical_data_size as u64
            + footer.map_size as u64
            + FOOTER_SIZE as u64;
        if expected != len {
            return Err(ChunkError::corrupted(
                &name,
                format!("file is {} bytes, footer describes {}", len, expected),
            ));
        }
        if !header.is_scavenged
            && (footer.map_size != 0 || footer.logical_data_size != footer.physical_data_size)
        {
            return Err(ChunkError::corrupted(
                &name,
                "unscavenged chunk with a position map or logical/physical size mismatch",
            ));
        }
        if footer.logical_data_size > header.logical_capacity() {
            return Err(ChunkError::corrupted(
                &name,
                format!(
                    "logical size {} exceeds chunk range {}",
                    footer.logical_data_size,
                    header.logical_capacity()
                ),
            ));
        }

        let pos_map = if header.is_scavenged && footer.map_size > 0 {
            let mut map_bytes = vec![0u8; footer.map_size as usize];
            read_exact_at(
                &mut file,
                HEADER_LEN + footer.physical_data_size as u64,
                &mut map_bytes,
                &name,
            )?;
            PosMapTable::parse(&map_bytes).map_err(|i| {
                ChunkError::corrupted(&name, format!("position map out of order at entry {}", i))
            })?
        } else {
            PosMapTable::default()
        };

        if verify_hash {
            verify_file_hash(&mut file, len, &footer, &name)?;
        }

        let readers = ReaderPool::new(
            &name,
            Some(path.to_path_buf()),
            options.reader_pool,
            Arc::clone(&options.metrics),
        )?;

        let chunk = Self {
            path: path.to_path_buf(),
            name,
            header,
            options: options.clone(),
            storage: Storage::File,
            mmap: OnceLock::new(),
            footer: OnceLock::new(),
            pos_map: OnceLock::new(),
            writer: Mutex::new(None),
            physical_size: AtomicI64::new(footer.physical_data_size),
            logical_size: AtomicI64::new(footer.logical_data_size),
            readers,
        };
        let _ = chunk.footer.set(footer);
        let _ = chunk.pos_map.set(pos_map);
        if options.memory_map {
            chunk.map_file()?;
        }
        Ok(chunk)
    }

    /// Reopen the writable chunk after a restart.
    ///
    /// Frames are re-scanned from the start up to `write_position` (local)
    /// to rebuild the running hash. A scan that cannot reach
    /// `write_position` means the writer checkpoint is ahead of durable
    /// data, which is fatal.
    pub fn open_ongoing(path: &Path, write_position: i64, options: &ChunkOptions) -> ChunkResult<Self> {
        let name = display_name(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                ChunkError::io_failed(format!("Failed to open chunk: {}", path.display()), e)
            })?;

        let mut header_buf = [0u8; HEADER_SIZE];
        read_exact_at(&mut file, 0, &mut header_buf, &name)?;
        let header = ChunkHeader::from_bytes(&name, &header_buf)?;
        if header.is_scavenged {
            return Err(ChunkError::corrupted(&name, "a scavenged chunk cannot be the writable chunk"));
        }
        if header.chunk_start_number != header.chunk_end_number {
            return Err(ChunkError::corrupted(&name, "the writable chunk must cover a single chunk number"));
        }
        if write_position < 0 || write_position > header.logical_capacity() {
            return Err(ChunkError::invariant(format!(
                "write position {} outside chunk {} capacity {}",
                write_position,
                name,
                header.logical_capacity()
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(header_buf);
        let start_position = header.chunk_start_position();
        let mut pos = 0i64;
        let mut frame = Vec::new();
        while pos < write_position {
            let framed = scan_frame(&mut file, pos, write_position, &mut frame).map_err(|reason| {
                ChunkError::corrupted_at(
                    &name,
                    pos,
                    format!(
                        "writer checkpoint at local {} is beyond durable data: {}",
                        write_position, reason
                    ),
                )
            })?;
            let body = &frame[4..frame.len() - 8];
            let record = LogRecord::decode(body).map_err(|e| codec_error(&name, pos, e))?;
            if record.log_position() != start_position + pos {
                return Err(ChunkError::corrupted_at(
                    &name,
                    pos,
                    format!("record claims position {}", record.log_position()),
                ));
            }
            hasher.update(&frame);
            pos += framed;
        }

        let readers = ReaderPool::new(
            &name,
            Some(path.to_path_buf()),
            options.reader_pool,
            Arc::clone(&options.metrics),
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            header,
            options: options.clone(),
            storage: Storage::File,
            mmap: OnceLock::new(),
            footer: OnceLock::new(),
            pos_map: OnceLock::new(),
            writer: Mutex::new(Some(WriterState {
                file: Some(file),
                hasher,
                logical_end: write_position,
            })),
            physical_size: AtomicI64::new(write_position),
            logical_size: AtomicI64::new(write_position),
            readers,
        })
    }

    /// In-memory chunks carry a synthetic path; after a swap it names the
    /// new version.
    pub(crate) fn relocated(self, path: PathBuf) -> Self {
        let name = display_name(&path);
        Self { path, name, ..self }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&ChunkFooter> {
        self.footer.get()
    }

    pub fn chunk_start_number(&self) -> i32 {
        self.header.chunk_start_number
    }

    pub fn chunk_end_number(&self) -> i32 {
        self.header.chunk_end_number
    }

    pub fn chunk_start_position(&self) -> i64 {
        self.header.chunk_start_position()
    }

    pub fn chunk_end_position(&self) -> i64 {
        self.header.chunk_end_position()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn is_completed(&self) -> bool {
        self.footer.get().is_some()
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    /// Bytes of the data region in use
    pub fn physical_data_size(&self) -> i64 {
        self.physical_size.load(Ordering::Acquire)
    }

    /// Local logical position one past the last record
    pub fn logical_data_size(&self) -> i64 {
        self.logical_size.load(Ordering::Acquire)
    }

    /// Header + data + map + footer
    pub fn file_size(&self) -> i64 {
        let map = self.footer.get().map(|f| f.map_size as i64).unwrap_or(0);
        HEADER_SIZE as i64 + self.physical_data_size() + map + FOOTER_SIZE as i64
    }

    pub fn pos_map(&self) -> &[PosMap] {
        self.pos_map.get().map(|m| m.entries()).unwrap_or(&[])
    }

    pub fn acquire_reader(&self) -> ChunkResult<ReaderLease<'_>> {
        self.readers.acquire()
    }

    /// Refuse new readers; the file is deleted when the last lease is released
    pub fn mark_for_deletion(&self) {
        self.readers.mark_for_deletion();
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.readers.is_marked_for_deletion()
    }

    pub fn is_deleted(&self) -> bool {
        self.readers.is_deleted()
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    pub fn try_append(&self, record: &LogRecord) -> ChunkResult<AppendResult> {
        let mut buf = Vec::with_capacity(256);
        self.try_append_buffered(record, &mut buf)
    }

    /// Append one record using `buf` as the encoding scratch space.
    ///
    /// An ordinary chunk requires the record to be stamped with the global
    /// position it is written at. A scavenged chunk keeps the record's
    /// original position.
    pub fn try_append_buffered(&self, record: &LogRecord, buf: &mut Vec<u8>) -> ChunkResult<AppendResult> {
        let mut guard = self.writer.lock();
        let state = guard.as_mut().ok_or_else(|| ChunkError::read_only(&self.name))?;

        let old = self.physical_size.load(Ordering::Acquire);
        frame_record(record, buf).map_err(|e| codec_error(&self.name, old, e))?;
        let framed = buf.len() as i64;
        let new = old + framed;
        if new > self.header.logical_capacity() {
            return Ok(AppendResult::Full);
        }

        let local_logical = record.log_position() - self.chunk_start_position();
        if self.header.is_scavenged {
            if local_logical < state.logical_end || local_logical + framed > self.header.logical_capacity() {
                return Err(ChunkError::invariant(format!(
                    "record at {} does not belong after local {} in scavenged chunk {}",
                    record.log_position(),
                    state.logical_end,
                    self.name
                )));
            }
        } else if local_logical != old {
            return Err(ChunkError::invariant(format!(
                "record stamped {} but chunk {} writes at {}",
                record.log_position(),
                self.name,
                self.chunk_start_position() + old
            )));
        }

        match (&self.storage, state.file.as_mut()) {
            (Storage::Memory(image), _) => {
                let mut image = image.write();
                image.truncate(HEADER_SIZE + old as usize);
                image.extend_from_slice(buf);
            }
            (Storage::File, Some(file)) => {
                file.seek(SeekFrom::Start(HEADER_LEN + old as u64))
                    .and_then(|_| file.write_all(buf))
                    .map_err(|e| {
                        ChunkError::io_failed(
                            format!("Failed to append to {} at {}", self.name, old),
                            e,
                        )
                    })?;
            }
            (Storage::File, None) => return Err(ChunkError::read_only(&self.name)),
        }

        state.hasher.update(&buf[..]);
        state.logical_end = local_logical + framed;
        self.logical_size.store(state.logical_end, Ordering::Release);
        self.physical_size.store(new, Ordering::Release);

        Ok(AppendResult::Written {
            old_position: old,
            new_position: new,
        })
    }

    /// fsync the data written so far
    pub fn flush(&self) -> ChunkResult<()> {
        let guard = self.writer.lock();
        if let Some(WriterState { file: Some(file), .. }) = guard.as_ref() {
            file.sync_data().map_err(|e| {
                ChunkError::fsync_failed(format!("fsync failed for chunk {}", self.name), e)
            })?;
        }
        Ok(())
    }

    /// Seal an ordinary chunk: write the footer and hash, drop write access.
    pub fn complete(&self) -> ChunkResult<()> {
        if self.header.is_scavenged {
            return Err(ChunkError::invariant(format!(
                "scavenged chunk {} must be completed with a position map",
                self.name
            )));
        }
        let state = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| ChunkError::read_only(&self.name))?;
        let physical = self.physical_data_size();
        self.write_footer(state, Vec::new(), ChunkFooter::new(physical, physical, 0))?;
        let _ = self.pos_map.set(PosMapTable::default());
        self.options.metrics.increment_chunks_completed();
        Ok(())
    }

    /// Seal a scavenged chunk with one map entry per surviving record.
    pub fn complete_scavenged(&self, pos_map: &[PosMap]) -> ChunkResult<()> {
        if !self.header.is_scavenged {
            return Err(ChunkError::invariant(format!(
                "chunk {} is not scavenged, it cannot carry a position map",
                self.name
            )));
        }
        let table = PosMapTable::new(pos_map.to_vec()).map_err(|i| {
            ChunkError::invariant(format!("position map out of order at entry {}", i))
        })?;
        let state = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| ChunkError::read_only(&self.name))?;

        let mut map_bytes = Vec::with_capacity(pos_map.len() * POS_MAP_SIZE);
        for entry in pos_map {
            entry.write_to(&mut map_bytes);
        }
        let footer = ChunkFooter::new(self.physical_data_size(), state.logical_end, pos_map.len());
        self.write_footer(state, map_bytes, footer)?;
        let _ = self.pos_map.set(table);
        Ok(())
    }

    fn write_footer(&self, state: WriterState, mut tail: Vec<u8>, mut footer: ChunkFooter) -> ChunkResult<()> {
        let WriterState { file, mut hasher, .. } = state;
        let physical = footer.physical_data_size;

        let footer_bytes = footer.to_bytes();
        tail.extend_from_slice(&footer_bytes[..footer::HASH_OFFSET]);
        hasher.update(&tail);
        footer.hash = footer::finish_hash(hasher);
        tail.extend_from_slice(&footer.hash);

        maybe_crash(points::CHUNK_BEFORE_FOOTER);

        match (&self.storage, file) {
            (Storage::Memory(image), _) => {
                let mut image = image.write();
                image.truncate(HEADER_SIZE + physical as usize);
                image.extend_from_slice(&tail);
            }
            (Storage::File, Some(mut file)) => {
                let end = HEADER_LEN + physical as u64;
                file.seek(SeekFrom::Start(end))
                    .and_then(|_| file.write_all(&tail))
                    .and_then(|_| file.set_len(end + tail.len() as u64))
                    .map_err(|e| {
                        ChunkError::io_failed(format!("Failed to write footer of {}", self.name), e)
                    })?;
                file.sync_all().map_err(|e| {
                    ChunkError::fsync_failed(format!("fsync failed completing {}", self.name), e)
                })?;
            }
            (Storage::File, None) => return Err(ChunkError::read_only(&self.name)),
        }

        maybe_crash(points::CHUNK_AFTER_FOOTER);

        self.logical_size.store(footer.logical_data_size, Ordering::Release);
        let _ = self.footer.set(footer);
        if self.options.memory_map && !self.is_in_memory() {
            self.map_file()?;
        }

        log_event_with_fields(
            Event::ChunkCompleted,
            &[
                ("chunk", &self.name),
                ("physical_size", &physical.to_string()),
                ("logical_size", &footer.logical_data_size.to_string()),
                ("map_entries", &footer.map_count().to_string()),
            ],
        );
        Ok(())
    }

    fn map_file(&self) -> ChunkResult<()> {
        let file = File::open(&self.path).map_err(|e| {
            ChunkError::io_failed(format!("Failed to open {} for mapping", self.name), e)
        })?;
        // SAFETY: completed chunk files are never written again; they are
        // only renamed or unlinked, which leaves an existing mapping intact.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| ChunkError::io_failed(format!("Failed to map {}", self.name), e))?;
        let _ = self.mmap.set(map);
        self.readers.switch_to_mapped();
        Ok(())
    }

    /// Recompute the content hash and compare it with the footer
    pub fn verify_hash(&self) -> ChunkResult<()> {
        let footer = *self
            .footer
            .get()
            .ok_or_else(|| ChunkError::invariant(format!("chunk {} is not completed", self.name)))?;
        let hashed_len = (self.file_size() as usize) - footer::HASH_SIZE;

        let computed = match (&self.storage, self.mmap.get()) {
            (Storage::Memory(image), _) => {
                let image = image.read();
                let mut hasher = Sha256::new();
                hasher.update(&image[..hashed_len]);
                footer::finish_hash(hasher)
            }
            (Storage::File, Some(map)) => {
                let mut hasher = Sha256::new();
                hasher.update(&map[..hashed_len]);
                footer::finish_hash(hasher)
            }
            (Storage::File, None) => {
                let mut file = File::open(&self.path).map_err(|e| {
                    ChunkError::io_failed(format!("Failed to open {}", self.name), e)
                })?;
                return verify_file_hash(&mut file, self.file_size() as u64, &footer, &self.name);
            }
        };

        if computed != footer.hash {
            log_event_with_fields(Event::ChunkCorruption, &[("chunk", &self.name)]);
            return Err(ChunkError::hash_mismatch(&self.name));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn read_bytes(&self, lease: &mut ReaderLease<'_>, offset: u64, buf: &mut [u8]) -> ChunkResult<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if let Storage::Memory(image) = &self.storage {
            let image = image.read();
            if end > image.len() {
                return Err(ChunkError::corrupted_at(&self.name, offset as i64, "read past end of chunk"));
            }
            buf.copy_from_slice(&image[start..end]);
            return Ok(());
        }
        if let Some(map) = self.mmap.get() {
            if end > map.len() {
                return Err(ChunkError::corrupted_at(&self.name, offset as i64, "read past end of chunk"));
            }
            buf.copy_from_slice(&map[start..end]);
            return Ok(());
        }
        let file = lease.handle_mut().ok_or_else(|| {
            ChunkError::invariant(format!("lease on {} carries no file handle", self.name))
        })?;
        read_exact_at(file, offset, buf, &self.name)
    }

    /// Read and verify the frame starting at `actual`
    fn read_frame(&self, lease: &mut ReaderLease<'_>, actual: i64) -> ChunkResult<(LogRecord, i32)> {
        let physical = self.physical_data_size();
        if actual < 0 || actual + FRAME_OVERHEAD > physical {
            return Err(ChunkError::corrupted_at(
                &self.name,
                actual,
                format!("no record frame fits before data end {}", physical),
            ));
        }

        let mut len_buf = [0u8; 4];
        self.read_bytes(lease, HEADER_LEN + actual as u64, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as i64;
        if len == 0 || actual + FRAME_OVERHEAD + len > physical {
            return Err(ChunkError::corrupted_at(
                &self.name,
                actual,
                format!("invalid record length {}", len),
            ));
        }

        let mut rest = vec![0u8; len as usize + 8];
        self.read_bytes(lease, HEADER_LEN + actual as u64 + 4, &mut rest)?;
        let body = &rest[..len as usize];
        let crc = u32::from_le_bytes(copy4(&rest[len as usize..]));
        let suffix = u32::from_le_bytes(copy4(&rest[len as usize + 4..])) as i64;
        if suffix != len {
            return Err(ChunkError::corrupted_at(&self.name, actual, "length prefix/suffix mismatch"));
        }
        if crc32fast::hash(body) != crc {
            return Err(ChunkError::corrupted_at(&self.name, actual, "record checksum mismatch"));
        }
        let record = LogRecord::decode(body).map_err(|e| codec_error(&self.name, actual, e))?;
        Ok((record, len as i32))
    }

    /// Read the frame that ends at `end` (exclusive)
    fn read_frame_before(&self, lease: &mut ReaderLease<'_>, end: i64) -> ChunkResult<(LogRecord, i32, i64)> {
        if end < FRAME_OVERHEAD {
            return Err(ChunkError::corrupted_at(&self.name, end, "no record frame ends here"));
        }
        let mut len_buf = [0u8; 4];
        self.read_bytes(lease, HEADER_LEN + (end - 4) as u64, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as i64;
        let start = end - FRAME_OVERHEAD - len;
        if len == 0 || start < 0 {
            return Err(ChunkError::corrupted_at(
                &self.name,
                end,
                format!("invalid record length suffix {}", len),
            ));
        }
        let (record, read_len) = self.read_frame(lease, start)?;
        if read_len as i64 != len {
            return Err(ChunkError::corrupted_at(&self.name, start, "length prefix/suffix mismatch"));
        }
        Ok((record, read_len, start))
    }

    fn local_of(&self, record: &LogRecord) -> i64 {
        record.log_position() - self.chunk_start_position()
    }

    fn forward_result(&self, record: LogRecord, actual: i64, len: i32) -> RecordReadResult {
        let start = if self.header.is_scavenged {
            self.local_of(&record)
        } else {
            actual
        };
        RecordReadResult {
            next_position: start + FRAME_OVERHEAD + len as i64,
            record,
            record_length: len,
        }
    }

    /// Map a local logical position to an offset in the data region
    fn resolve(&self, local: i64, could_be_scavenged: bool) -> ChunkResult<Option<i64>> {
        if local < 0 {
            return Err(ChunkError::invariant(format!(
                "negative local position {} in chunk {}",
                local, self.name
            )));
        }
        if self.header.is_scavenged {
            return match self.pos_map.get().and_then(|m| m.actual_position(local)) {
                Some(actual) => Ok(Some(actual)),
                None if could_be_scavenged => Ok(None),
                None => Err(ChunkError::invariant(format!(
                    "position {} is not in the position map of {}",
                    local, self.name
                ))),
            };
        }
        if local >= self.logical_data_size() {
            return Ok(None);
        }
        Ok(Some(local))
    }

    /// Record at exactly `local`.
    ///
    /// On a scavenged chunk a position missing from the map returns `None`
    /// when `could_be_scavenged` is set and is an invariant error otherwise.
    pub fn try_read_at(&self, local: i64, could_be_scavenged: bool) -> ChunkResult<Option<RecordReadResult>> {
        let mut lease = self.readers.acquire()?;
        let Some(actual) = self.resolve(local, could_be_scavenged)? else {
            return Ok(None);
        };
        let (record, len) = self.read_frame(&mut lease, actual)?;
        Ok(Some(self.forward_result(record, actual, len)))
    }

    pub fn exists_at(&self, local: i64) -> bool {
        if local < 0 {
            return false;
        }
        if self.header.is_scavenged {
            return self
                .pos_map
                .get()
                .map(|m| m.actual_position(local).is_some())
                .unwrap_or(false);
        }
        local < self.logical_data_size()
    }

    /// Offset in the data region of the record at `local`, if present
    pub fn get_actual_position(&self, local: i64) -> Option<i64> {
        if self.header.is_scavenged {
            self.pos_map.get().and_then(|m| m.actual_position(local))
        } else if local >= 0 && local < self.logical_data_size() {
            Some(local)
        } else {
            None
        }
    }

    pub fn try_read_first(&self) -> ChunkResult<Option<RecordReadResult>> {
        self.try_read_closest_forward(0)
    }

    /// First record at or after `local`
    pub fn try_read_closest_forward(&self, local: i64) -> ChunkResult<Option<RecordReadResult>> {
        let mut lease = self.readers.acquire()?;
        let actual = if self.header.is_scavenged {
            match self.pos_map.get().and_then(|m| m.closest_forward(local)) {
                Some(entry) => entry.actual_pos,
                None => return Ok(None),
            }
        } else {
            if local < 0 || local >= self.logical_data_size() {
                return Ok(None);
            }
            local
        };
        let (record, len) = self.read_frame(&mut lease, actual)?;
        Ok(Some(self.forward_result(record, actual, len)))
    }

    pub fn try_read_last(&self) -> ChunkResult<Option<RecordReadResult>> {
        self.try_read_closest_backward(self.logical_data_size())
    }

    /// Last record that starts before `local`. `next_position` is that
    /// record's own start, the place to continue reading backwards from.
    pub fn try_read_closest_backward(&self, local: i64) -> ChunkResult<Option<RecordReadResult>> {
        let mut lease = self.readers.acquire()?;
        if self.header.is_scavenged {
            let Some(entry) = self.pos_map.get().and_then(|m| m.closest_backward(local)) else {
                return Ok(None);
            };
            let (record, len) = self.read_frame(&mut lease, entry.actual_pos)?;
            return Ok(Some(RecordReadResult {
                next_position: entry.log_pos,
                record,
                record_length: len,
            }));
        }

        let end = local.min(self.logical_data_size());
        if end <= 0 {
            return Ok(None);
        }
        let (record, len, start) = self.read_frame_before(&mut lease, end)?;
        Ok(Some(RecordReadResult {
            next_position: start,
            record,
            record_length: len,
        }))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("name", &self.name)
            .field("start", &self.header.chunk_start_number)
            .field("end", &self.header.chunk_end_number)
            .field("scavenged", &self.header.is_scavenged)
            .field("completed", &self.is_completed())
            .field("physical_size", &self.physical_data_size())
            .finish()
    }
}

/// Frame `record` into `buf`: `[len][body][crc32][len]`
pub(crate) fn frame_record(record: &LogRecord, buf: &mut Vec<u8>) -> Result<(), crate::tlog::record::CodecError> {
    buf.clear();
    buf.extend_from_slice(&[0u8; 4]);
    record.encode_into(buf)?;
    let len = (buf.len() - 4) as u32;
    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Size of `record` once framed
pub fn framed_size(record_length: i32) -> i64 {
    record_length as i64 + FRAME_OVERHEAD
}

fn copy4(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&b[..4]);
    out
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8], chunk: &str) -> ChunkResult<()> {
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(buf))
        .map_err(|e| ChunkError::io_failed(format!("Failed to read {} at {}", chunk, offset), e))
}

/// Read one whole frame at local `pos` into `frame` and verify it, without
/// reading past `limit`. Returns the framed length.
fn scan_frame(file: &mut File, pos: i64, limit: i64, frame: &mut Vec<u8>) -> Result<i64, String> {
    if pos + FRAME_OVERHEAD > limit {
        return Err("partial frame header".to_string());
    }
    let mut len_buf = [0u8; 4];
    file.seek(SeekFrom::Start(HEADER_LEN + pos as u64))
        .and_then(|_| file.read_exact(&mut len_buf))
        .map_err(|e| e.to_string())?;
    let len = u32::from_le_bytes(len_buf) as i64;
    if len == 0 || pos + FRAME_OVERHEAD + len > limit {
        return Err(format!("invalid record length {}", len));
    }

    frame.clear();
    frame.resize(len as usize + FRAME_OVERHEAD as usize, 0);
    frame[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut frame[4..]).map_err(|e| e.to_string())?;

    let body_end = 4 + len as usize;
    let crc = u32::from_le_bytes(copy4(&frame[body_end..]));
    let suffix = u32::from_le_bytes(copy4(&frame[body_end + 4..])) as i64;
    if suffix != len {
        return Err("length prefix/suffix mismatch".to_string());
    }
    if crc32fast::hash(&frame[4..body_end]) != crc {
        return Err("record checksum mismatch".to_string());
    }
    Ok(len + FRAME_OVERHEAD)
}

fn verify_file_hash(file: &mut File, len: u64, footer: &ChunkFooter, chunk: &str) -> ChunkResult<()> {
    let hashed_len = len - footer::HASH_SIZE as u64;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ChunkError::io_failed(format!("Failed to read {}", chunk), e))?;

    let mut hasher = Sha256::new();
    let mut block = vec![0u8; HASH_BLOCK];
    let mut remaining = hashed_len;
    while remaining > 0 {
        let n = remaining.min(HASH_BLOCK as u64) as usize;
        file.read_exact(&mut block[..n])
            .map_err(|e| ChunkError::io_failed(format!("Failed to read {} for hashing", chunk), e))?;
        hasher.update(&block[..n]);
        remaining -= n as u64;
    }

    if footer::finish_hash(hasher) != footer.hash {
        log_event_with_fields(Event::ChunkCorruption, &[("chunk", chunk)]);
        return Err(ChunkError::hash_mismatch(chunk));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlog::record::PrepareRecord;
    use std::fs;
    use tempfile::TempDir;

    const CHUNK_SIZE: i32 = 4096;

    fn prepare_at(position: i64, stream: &str, expected: i64) -> LogRecord {
        let mut record = LogRecord::Prepare(PrepareRecord::single_write(
            stream,
            expected,
            "Tested",
            vec![0xAB; 40],
        ));
        record.rebase(position);
        record
    }

    fn memory_options() -> ChunkOptions {
        ChunkOptions {
            in_memory: true,
            ..ChunkOptions::default()
        }
    }

    fn append_n(chunk: &Chunk, n: usize) -> Vec<i64> {
        let mut positions = Vec::new();
        for i in 0..n {
            let pos = chunk.chunk_start_position() + chunk.physical_data_size();
            let record = prepare_at(pos, "s", i as i64 - 1);
            match chunk.try_append(&record).unwrap() {
                AppendResult::Written { old_position, .. } => positions.push(old_position),
                AppendResult::Full => panic!("chunk unexpectedly full"),
            }
        }
        positions
    }

    // =========================================================================
    // Append and read
    // =========================================================================

    #[test]
    fn test_append_then_read_in_memory() {
        let chunk = Chunk::create_new(Path::new("mem/chunk-000000.000000"), CHUNK_SIZE, 0, 0, false, &memory_options()).unwrap();
        let positions = append_n(&chunk, 3);

        let first = chunk.try_read_at(positions[0], false).unwrap().unwrap();
        assert_eq!(first.next_position, positions[1]);
        assert_eq!(first.record.log_position(), 0);

        let last = chunk.try_read_last().unwrap().unwrap();
        assert_eq!(last.next_position, positions[2]);
        assert!(chunk.exists_at(positions[2]));
        assert!(!chunk.exists_at(chunk.logical_data_size()));
        assert!(chunk.try_read_at(chunk.logical_data_size(), false).unwrap().is_none());
    }

    #[test]
    fn test_full_chunk_rejects_without_writing() {
        let chunk = Chunk::create_new(Path::new("mem/chunk-000000.000000"), 256, 0, 0, false, &memory_options()).unwrap();
        let mut written = 0;
        loop {
            let pos = chunk.physical_data_size();
            match chunk.try_append(&prepare_at(pos, "s", -1)).unwrap() {
                AppendResult::Written { .. } => written += 1,
                AppendResult::Full => break,
            }
        }
        assert!(written > 0);
        let size = chunk.physical_data_size();
        assert!(size <= 256);
        assert_eq!(chunk.try_append(&prepare_at(size, "s", -1)).unwrap(), AppendResult::Full);
        assert_eq!(chunk.physical_data_size(), size);
    }

    #[test]
    fn test_misstamped_record_is_invariant_error() {
        let chunk = Chunk::create_new(Path::new("mem/chunk-000000.000000"), CHUNK_SIZE, 0, 0, false, &memory_options()).unwrap();
        let err = chunk.try_append(&prepare_at(999, "s", -1)).unwrap_err();
        assert!(err.is_fatal());
    }

    // =========================================================================
    // Completion and hashing
    // =========================================================================

    #[test]
    fn test_complete_and_reopen_verifies_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let options = ChunkOptions::default();

        let chunk = Chunk::create_new(&path, CHUNK_SIZE, 0, 0, false, &options).unwrap();
        let positions = append_n(&chunk, 5);
        chunk.complete().unwrap();
        chunk.verify_hash().unwrap();
        assert!(chunk.try_append(&prepare_at(0, "s", 0)).is_err());
        let expected_size = chunk.file_size() as u64;
        drop(chunk);

        assert_eq!(fs::metadata(&path).unwrap().len(), expected_size);
        let reopened = Chunk::open_completed(&path, true, &options).unwrap();
        assert!(reopened.is_completed());
        for pos in positions {
            assert!(reopened.try_read_at(pos, false).unwrap().is_some());
        }
    }

    #[test]
    fn test_flipped_byte_fails_hash_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let options = ChunkOptions::default();
        let chunk = Chunk::create_new(&path, CHUNK_SIZE, 0, 0, false, &options).unwrap();
        append_n(&chunk, 2);
        chunk.complete().unwrap();
        drop(chunk);

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 30] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = Chunk::open_completed(&path, true, &options).unwrap_err();
        assert_eq!(err.code(), crate::tlog::errors::ChunkErrorCode::HashMismatch);
        assert!(Chunk::open_completed(&path, false, &options).is_ok());
    }

    #[test]
    fn test_unmapped_reads_use_file_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let options = ChunkOptions {
            memory_map: false,
            ..ChunkOptions::default()
        };
        let chunk = Chunk::create_new(&path, CHUNK_SIZE, 0, 0, false, &options).unwrap();
        let positions = append_n(&chunk, 4);

        // ongoing chunk: readers see appended data before completion
        let read = chunk.try_read_at(positions[3], false).unwrap().unwrap();
        assert_eq!(read.next_position, chunk.logical_data_size());

        chunk.complete().unwrap();
        let back = chunk.try_read_closest_backward(positions[2]).unwrap().unwrap();
        assert_eq!(back.next_position, positions[1]);
    }

    // =========================================================================
    // Reopening the writable chunk
    // =========================================================================

    #[test]
    fn test_open_ongoing_rescans_to_write_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let options = ChunkOptions::default();
        let write_position = {
            let chunk = Chunk::create_new(&path, CHUNK_SIZE, 0, 0, false, &options).unwrap();
            append_n(&chunk, 3);
            chunk.flush().unwrap();
            chunk.physical_data_size()
        };

        let chunk = Chunk::open_ongoing(&path, write_position, &options).unwrap();
        assert_eq!(chunk.physical_data_size(), write_position);
        append_n(&chunk, 1);
        chunk.complete().unwrap();
        drop(chunk);

        Chunk::open_completed(&path, true, &options).unwrap();
    }

    #[test]
    fn test_open_ongoing_beyond_durable_data_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunk-000000.000000");
        let options = ChunkOptions::default();
        let write_position = {
            let chunk = Chunk::create_new(&path, CHUNK_SIZE, 0, 0, false, &options).unwrap();
            append_n(&chunk, 2);
            chunk.physical_data_size()
        };

        let err = Chunk::open_ongoing(&path, write_position + 64, &options).unwrap_err();
        assert!(err.is_fatal());
    }

    // =========================================================================
    // Scavenged chunks
    // =========================================================================

    #[test]
    fn test_scavenged_chunk_resolves_through_pos_map() {
        let source = Chunk::create_new(Path::new("mem/chunk-000001.000000"), CHUNK_SIZE, 1, 1, false, &memory_options()).unwrap();
        let positions = append_n(&source, 4);
        source.complete().unwrap();

        let target = Chunk::create_new(Path::new("mem/tmp.scavenge.tmp"), CHUNK_SIZE, 1, 1, true, &memory_options()).unwrap();
        let mut map = Vec::new();
        for &keep in &[positions[1], positions[3]] {
            let read = source.try_read_at(keep, false).unwrap().unwrap();
            if let AppendResult::Written { old_position, .. } = target.try_append(&read.record).unwrap() {
                map.push(PosMap::new(keep, old_position));
            }
        }
        target.complete_scavenged(&map).unwrap();
        target.verify_hash().unwrap();

        assert!(target.physical_data_size() < source.physical_data_size());
        assert!(!target.exists_at(positions[0]));
        assert!(target.exists_at(positions[1]));
        assert!(target.try_read_at(positions[0], true).unwrap().is_none());
        assert!(target.try_read_at(positions[0], false).is_err());

        let kept = target.try_read_at(positions[3], false).unwrap().unwrap();
        let original = source.try_read_at(positions[3], false).unwrap().unwrap();
        assert_eq!(kept.record, original.record);
        assert_eq!(kept.next_position, original.next_position);

        let forward = target.try_read_closest_forward(0).unwrap().unwrap();
        assert_eq!(forward.record.log_position(), 4096 + positions[1]);
        let backward = target.try_read_last().unwrap().unwrap();
        assert_eq!(backward.next_position, positions[3]);
    }
}
