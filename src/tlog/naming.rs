//! Chunk file naming: `<prefix><6-digit number>.<6-digit version>`.
//!
//! The number is the first chunk number the file covers. A scavenged file
//! that merged several chunks is named after its first chunk. Temporary
//! scavenge output is `<uuid>.scavenge.tmp` in the same directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub const TEMP_SUFFIX: &str = ".scavenge.tmp";

/// A chunk file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileName {
    pub path: PathBuf,
    pub number: i32,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct ChunkNaming {
    dir: PathBuf,
    prefix: String,
}

impl ChunkNaming {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(&self, number: i32, version: i32) -> PathBuf {
        self.dir
            .join(format!("{}{:06}.{:06}", self.prefix, number, version))
    }

    /// `(number, version)` of a chunk file name, `None` for anything else
    pub fn parse(&self, file_name: &str) -> Option<(i32, i32)> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        let (number, version) = rest.split_once('.')?;
        if number.len() != 6 || version.len() != 6 {
            return None;
        }
        if !number.bytes().chain(version.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    /// All chunk files in the directory, sorted by number then version
    pub fn enumerate_files(&self) -> io::Result<Vec<ChunkFileName>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, version)) = self.parse(name) {
                files.push(ChunkFileName {
                    path: entry.path(),
                    number,
                    version,
                });
            }
        }
        files.sort_by_key(|f| (f.number, f.version));
        Ok(files)
    }

    /// Highest version present on disk for `number`
    pub fn determine_best_version(&self, number: i32) -> io::Result<Option<i32>> {
        Ok(self
            .enumerate_files()?
            .into_iter()
            .filter(|f| f.number == number)
            .map(|f| f.version)
            .max())
    }

    pub fn temp_file_name(&self) -> PathBuf {
        self.dir.join(format!("{}{}", Uuid::new_v4(), TEMP_SUFFIX))
    }

    pub fn enumerate_temp_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .map(|n| n.ends_with(TEMP_SUFFIX))
                .unwrap_or(false)
            {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}
