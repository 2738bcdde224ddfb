//! The set of PTables that make up the index, by level.
//!
//! Persisted as `indexmap` in the index directory:
//!
//! ```text
//! {"version":1,"commit_checkpoint":4096,"levels":[["ptable-<uuid>"],[]]}
//! 3a1f09c2
//! ```
//!
//! The second line is the crc32 of the first. The map is written to a
//! temporary file, fsynced and renamed over the old one, so a crash leaves
//! either the old map or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::{IndexError, IndexResult};
use super::ptable::PTable;
use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event};

pub const INDEX_MAP_FILE: &str = "indexmap";
const INDEX_MAP_TEMP: &str = "indexmap.tmp";
const INDEX_MAP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexMapFile {
    version: u32,
    commit_checkpoint: i64,
    levels: Vec<Vec<String>>,
}

/// Immutable snapshot of the table set; replaced as a whole on every change
#[derive(Debug, Clone)]
pub struct IndexMap {
    /// Level 0 first; within a level, oldest table first
    levels: Vec<Vec<Arc<PTable>>>,
    /// Highest log position whose entries are in the tables
    commit_checkpoint: i64,
}

impl IndexMap {
    pub fn empty() -> Self {
        Self {
            levels: Vec::new(),
            commit_checkpoint: -1,
        }
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    pub fn levels(&self) -> &[Vec<Arc<PTable>>] {
        &self.levels
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Tables newest first: lowest level first, latest table first in a level
    pub fn tables_newest_first(&self) -> impl Iterator<Item = &Arc<PTable>> {
        self.levels.iter().flat_map(|level| level.iter().rev())
    }

    pub fn all_tables(&self) -> impl Iterator<Item = &Arc<PTable>> {
        self.levels.iter().flatten()
    }

    /// New map with `table` appended to `level`
    pub fn with_table(&self, level: usize, table: Arc<PTable>, commit_checkpoint: i64) -> Self {
        let mut levels = self.levels.clone();
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(table);
        Self {
            levels,
            commit_checkpoint: commit_checkpoint.max(self.commit_checkpoint),
        }
    }

    /// New map with `level` emptied and `merged` appended to `level + 1`
    pub fn with_level_merged(&self, level: usize, merged: Arc<PTable>) -> Self {
        let mut levels = self.levels.clone();
        if levels.len() <= level + 1 {
            levels.resize_with(level + 2, Vec::new);
        }
        levels[level].clear();
        levels[level + 1].push(merged);
        Self {
            levels,
            commit_checkpoint: self.commit_checkpoint,
        }
    }

    /// New map with every table replaced one for one
    pub fn with_levels(&self, levels: Vec<Vec<Arc<PTable>>>) -> Self {
        Self {
            levels,
            commit_checkpoint: self.commit_checkpoint,
        }
    }

    /// Write the map durably into `dir`.
    pub fn save(&self, dir: &Path) -> IndexResult<()> {
        let mut levels = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            let mut names = Vec::with_capacity(level.len());
            for table in level {
                names.push(PTable::file_name(table.id()));
            }
            levels.push(names);
        }
        let body = serde_json::to_string(&IndexMapFile {
            version: INDEX_MAP_VERSION,
            commit_checkpoint: self.commit_checkpoint,
            levels,
        })
        .map_err(|e| {
            IndexError::io_failed(
                "Failed to serialize index map",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        let contents = format!("{}\n{:08x}\n", body, crc32fast::hash(body.as_bytes()));

        let temp = dir.join(INDEX_MAP_TEMP);
        let target = dir.join(INDEX_MAP_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| {
                IndexError::io_failed(format!("Failed to create {}", temp.display()), e)
            })?;
        file.write_all(contents.as_bytes()).map_err(|e| {
            IndexError::io_failed(format!("Failed to write {}", temp.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            IndexError::fsync_failed(format!("Failed to fsync {}", temp.display()), e)
        })?;
        drop(file);

        maybe_crash(points::INDEX_BEFORE_MAP_RENAME);
        fs::rename(&temp, &target).map_err(|e| {
            IndexError::io_failed(format!("Failed to rename {}", temp.display()), e)
        })?;
        sync_dir(dir)?;
        maybe_crash(points::INDEX_AFTER_MAP_RENAME);

        log_event_with_fields(
            Event::IndexMapSaved,
            &[
                ("tables", &self.table_count().to_string()),
                ("commit_checkpoint", &self.commit_checkpoint.to_string()),
            ],
        );
        Ok(())
    }

    /// Load the map from `dir`, opening every table it names. A missing map
    /// file is an empty index.
    pub fn load(dir: &Path, verify_hashes: bool) -> IndexResult<Self> {
        let path = dir.join(INDEX_MAP_FILE);
        if !path.exists() {
            return Ok(Self::empty());
        }
        let name = path.display().to_string();
        let contents = fs::read_to_string(&path)
            .map_err(|e| IndexError::io_failed(format!("Failed to read {}", name), e))?;

        let mut lines = contents.lines();
        let (Some(body), Some(crc)) = (lines.next(), lines.next()) else {
            return Err(IndexError::corrupted(&name, "index map is truncated"));
        };
        let expected = u32::from_str_radix(crc.trim(), 16)
            .map_err(|_| IndexError::corrupted(&name, "index map checksum is not hex"))?;
        if crc32fast::hash(body.as_bytes()) != expected {
            return Err(IndexError::corrupted(&name, "index map checksum mismatch"));
        }
        let file: IndexMapFile = serde_json::from_str(body)
            .map_err(|e| IndexError::corrupted(&name, format!("invalid index map: {}", e)))?;
        if file.version != INDEX_MAP_VERSION {
            return Err(IndexError::bad_version(
                &name,
                format!("unsupported index map version {}", file.version),
            ));
        }

        let mut levels = Vec::with_capacity(file.levels.len());
        for names in &file.levels {
            let mut level = Vec::with_capacity(names.len());
            for table in names {
                let table_path = dir.join(table);
                if !table_path.exists() {
                    return Err(IndexError::corrupted(
                        &name,
                        format!("index map names missing table {}", table),
                    ));
                }
                level.push(Arc::new(PTable::open(&table_path, verify_hashes)?));
            }
            levels.push(level);
        }
        Ok(Self {
            levels,
            commit_checkpoint: file.commit_checkpoint,
        })
    }

    /// Table files in `dir` that this map does not reference
    pub fn orphaned_files(&self, dir: &Path) -> IndexResult<Vec<PathBuf>> {
        let mut orphans = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| {
            IndexError::io_failed(format!("Failed to list {}", dir.display()), e)
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                IndexError::io_failed(format!("Failed to list {}", dir.display()), e)
            })?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            let Some(id) = PTable::parse_file_name(file_name) else {
                if file_name == INDEX_MAP_TEMP {
                    orphans.push(entry.path());
                }
                continue;
            };
            if !self.all_tables().any(|t| t.id() == id) {
                orphans.push(entry.path());
            }
        }
        Ok(orphans)
    }
}

fn sync_dir(dir: &Path) -> IndexResult<()> {
    let handle = File::open(dir).map_err(|e| {
        IndexError::io_failed(format!("Failed to open {} for fsync", dir.display()), e)
    })?;
    handle.sync_all().map_err(|e| {
        IndexError::fsync_failed(format!("Failed to fsync {}", dir.display()), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::IndexEntry;
    use tempfile::TempDir;

    #[test]
    fn test_missing_map_is_empty() {
        let dir = TempDir::new().unwrap();
        let map = IndexMap::load(dir.path(), true).unwrap();
        assert_eq!(map.table_count(), 0);
        assert_eq!(map.commit_checkpoint(), -1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let t0 = Arc::new(PTable::create(dir.path(), &[IndexEntry::new(1, 0, 10)], 0).unwrap());
        let t1 = Arc::new(PTable::create(dir.path(), &[IndexEntry::new(2, 0, 20)], 1).unwrap());
        let map = IndexMap::empty()
            .with_table(0, t0, 10)
            .with_table(1, t1, 20);
        map.save(dir.path()).unwrap();

        let loaded = IndexMap::load(dir.path(), true).unwrap();
        assert_eq!(loaded.commit_checkpoint(), 20);
        assert_eq!(loaded.levels().len(), 2);
        assert_eq!(loaded.levels()[1][0].try_get_one_value(2, 0), Some(20));
        assert!(loaded.orphaned_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        IndexMap::empty().save(dir.path()).unwrap();
        let path = dir.path().join(INDEX_MAP_FILE);
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("-1", "-2")).unwrap();

        let err = IndexMap::load(dir.path(), true).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unreferenced_tables_are_orphans() {
        let dir = TempDir::new().unwrap();
        let kept = Arc::new(PTable::create(dir.path(), &[IndexEntry::new(1, 0, 10)], 0).unwrap());
        let stray = PTable::create(dir.path(), &[IndexEntry::new(3, 0, 30)], 0).unwrap();
        let map = IndexMap::empty().with_table(0, kept, 10);
        map.save(dir.path()).unwrap();

        let orphans = map.orphaned_files(dir.path()).unwrap();
        assert_eq!(orphans, vec![stray.path().unwrap().to_path_buf()]);
    }
}
