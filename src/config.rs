//! Database configuration.
//!
//! Loaded from a JSON file. Every field except `data_dir` has a default, so
//! a minimal file is `{"data_dir": "/var/lib/streamdb"}`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::tlog::chunk::{ChunkOptions, ReaderPoolConfig};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Directory holding chunks, checkpoints and the index (required)
    pub data_dir: PathBuf,

    /// Logical bytes per chunk (default 256MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,

    /// Keep everything in memory; nothing touches `data_dir`
    #[serde(default)]
    pub in_memory: bool,

    #[serde(default = "default_chunk_file_prefix")]
    pub chunk_file_prefix: String,

    /// Verify completed chunk hashes when opening the database
    #[serde(default = "default_true")]
    pub verify_chunk_hashes: bool,

    #[serde(default = "default_true")]
    pub memory_map_completed: bool,

    #[serde(default = "default_initial_reader_count")]
    pub initial_reader_count: usize,

    /// Upper bound on concurrent reads per chunk
    #[serde(default = "default_max_reader_count")]
    pub max_reader_count: usize,

    #[serde(default = "default_reader_wait_timeout_ms")]
    pub reader_wait_timeout_ms: u64,

    /// MemTable entry count that triggers a flush
    #[serde(default = "default_max_mem_table_size")]
    pub max_mem_table_size: usize,

    /// Tables per level before a merge into the next level
    #[serde(default = "default_max_tables_per_level")]
    pub max_tables_per_level: usize,

    #[serde(default = "default_true")]
    pub verify_index_hashes: bool,

    /// Implicit max count of every metastream
    #[serde(default = "default_metastream_max_count")]
    pub metastream_max_count: i64,

    /// Scavenge worker threads (1..=4)
    #[serde(default = "default_scavenge_threads")]
    pub scavenge_threads: usize,

    /// Swap scavenged chunks in even when they are not smaller
    #[serde(default)]
    pub always_keep_scavenged: bool,

    /// Merge adjacent scavenged chunks that fit into one
    #[serde(default = "default_true")]
    pub merge_chunks: bool,
}

fn default_chunk_size() -> i32 {
    256 * 1024 * 1024
}
fn default_chunk_file_prefix() -> String {
    "chunk-".to_string()
}
fn default_true() -> bool {
    true
}
fn default_initial_reader_count() -> usize {
    2
}
fn default_max_reader_count() -> usize {
    16
}
fn default_reader_wait_timeout_ms() -> u64 {
    5_000
}
fn default_max_mem_table_size() -> usize {
    1_000_000
}
fn default_max_tables_per_level() -> usize {
    4
}
fn default_metastream_max_count() -> i64 {
    1
}
fn default_scavenge_threads() -> usize {
    1
}

pub const MAX_SCAVENGE_THREADS: usize = 4;
const MIN_CHUNK_SIZE: i32 = 1024;

impl DbConfig {
    /// Configuration with defaults for everything but `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunk_size: default_chunk_size(),
            in_memory: false,
            chunk_file_prefix: default_chunk_file_prefix(),
            verify_chunk_hashes: true,
            memory_map_completed: true,
            initial_reader_count: default_initial_reader_count(),
            max_reader_count: default_max_reader_count(),
            reader_wait_timeout_ms: default_reader_wait_timeout_ms(),
            max_mem_table_size: default_max_mem_table_size(),
            max_tables_per_level: default_max_tables_per_level(),
            verify_index_hashes: true,
            metastream_max_count: default_metastream_max_count(),
            scavenge_threads: default_scavenge_threads(),
            always_keep_scavenged: false,
            merge_chunks: true,
        }
    }

    /// In-memory database with a small chunk size, for tests
    pub fn in_memory(chunk_size: i32) -> Self {
        Self {
            in_memory: true,
            chunk_size,
            ..Self::new("in-memory")
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: DbConfig = serde_json::from_str(&content)?;
        config.validate()?;
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("chunk_size", &config.chunk_size.to_string()),
                ("in_memory", &config.in_memory.to_string()),
            ],
        );
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::invalid(
                "chunk_size",
                format!("must be at least {} bytes", MIN_CHUNK_SIZE),
            ));
        }
        if self.chunk_file_prefix.is_empty() || self.chunk_file_prefix.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "chunk_file_prefix",
                "must be a non-empty file name prefix",
            ));
        }
        if self.max_reader_count == 0 {
            return Err(ConfigError::invalid("max_reader_count", "must be > 0"));
        }
        if self.initial_reader_count > self.max_reader_count {
            return Err(ConfigError::invalid(
                "initial_reader_count",
                "must not exceed max_reader_count",
            ));
        }
        if self.max_mem_table_size == 0 {
            return Err(ConfigError::invalid("max_mem_table_size", "must be > 0"));
        }
        if self.max_tables_per_level < 2 {
            return Err(ConfigError::invalid("max_tables_per_level", "must be >= 2"));
        }
        if self.metastream_max_count < 1 {
            return Err(ConfigError::invalid("metastream_max_count", "must be >= 1"));
        }
        if self.scavenge_threads == 0 || self.scavenge_threads > MAX_SCAVENGE_THREADS {
            return Err(ConfigError::invalid(
                "scavenge_threads",
                format!("must be between 1 and {}", MAX_SCAVENGE_THREADS),
            ));
        }
        Ok(())
    }

    pub fn chunks_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn reader_pool(&self) -> ReaderPoolConfig {
        ReaderPoolConfig {
            initial_reader_count: self.initial_reader_count,
            max_reader_count: self.max_reader_count,
            wait_timeout: Duration::from_millis(self.reader_wait_timeout_ms),
        }
    }

    pub fn chunk_options(&self, metrics: Arc<MetricsRegistry>) -> ChunkOptions {
        ChunkOptions {
            in_memory: self.in_memory,
            memory_map: self.memory_map_completed,
            reader_pool: self.reader_pool(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"data_dir": "/tmp/streamdb"}"#).unwrap();

        let config = DbConfig::load(&path).unwrap();
        assert_eq!(config.chunk_size, 256 * 1024 * 1024);
        assert_eq!(config.chunk_file_prefix, "chunk-");
        assert_eq!(config.metastream_max_count, 1);
        assert!(config.verify_chunk_hashes);
        assert!(!config.in_memory);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = DbConfig::in_memory(4096);
        config.scavenge_threads = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "scavenge_threads", .. })
        ));

        let mut config = DbConfig::in_memory(4096);
        config.initial_reader_count = 20;
        assert!(config.validate().is_err());

        assert!(DbConfig::in_memory(100).validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(DbConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = DbConfig::load(Path::new("/nonexistent/streamdb.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
