//! Configuration types for Strata
//!
//! Every section has a `Default` so a partial TOML file is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for an engine instance
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage placement
    pub storage: StorageConfig,
    /// Buffer pool sizing and eviction
    pub buffer_pool: BufferPoolConfig,
    /// Journal settings
    pub journal: JournalConfig,
    /// Index settings
    pub btree: BTreeConfig,
}

impl EngineConfig {
    /// In-memory engine, used by tests and scratch sessions
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                backend: StoreBackend::Memory,
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    /// Engine rooted in `data_dir` with the given backend
    #[must_use]
    pub fn at(data_dir: impl Into<PathBuf>, backend: StoreBackend) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
                backend,
            },
            ..Self::default()
        }
    }

    /// Path of the page store file for file-backed stores
    #[must_use]
    pub fn page_store_path(&self) -> PathBuf {
        let name = match self.storage.backend {
            StoreBackend::Memory | StoreBackend::Mmap => "pages.dat",
            StoreBackend::Redb => "pages.redb",
        };
        self.storage.data_dir.join(name)
    }

    /// Path of the journal file
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.journal.file_name)
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.btree.order < 3 {
            return Err(Error::Configuration(format!(
                "btree.order must be at least 3, got {}",
                self.btree.order
            )));
        }
        // node entry counts are stored as u16
        if self.btree.order > u16::MAX as usize {
            return Err(Error::Configuration(format!(
                "btree.order must be at most {}, got {}",
                u16::MAX,
                self.btree.order
            )));
        }
        if self.buffer_pool.low_water_pages > self.buffer_pool.high_water_pages {
            return Err(Error::Configuration(
                "buffer_pool.low_water_pages exceeds high_water_pages".into(),
            ));
        }
        if self.journal.file_name.is_empty() {
            return Err(Error::Configuration("journal.file_name is empty".into()));
        }
        Ok(())
    }
}

/// Page store backing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Volatile, process-local
    Memory,
    /// Memory-mapped page file
    #[default]
    Mmap,
    /// Embedded key-value store
    Redb,
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "mmap" => Ok(Self::Mmap),
            "redb" => Ok(Self::Redb),
            other => Err(Error::Configuration(format!("unknown store backend: {other}"))),
        }
    }
}

/// Storage placement
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the page store and the journal
    pub data_dir: PathBuf,
    /// Which page store to open
    pub backend: StoreBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata-data"),
            backend: StoreBackend::default(),
        }
    }
}

/// Buffer pool sizing and eviction
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Cached page count above which the collector starts evicting
    pub high_water_pages: usize,
    /// Cached page count the collector evicts down to
    pub low_water_pages: usize,
    /// Collector period
    pub gc_interval_ms: u64,
    /// Pages touched more recently than this are never evicted
    pub stale_after_ms: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            high_water_pages: 16 * 1024, // 64MB of frames
            low_water_pages: 12 * 1024,
            gc_interval_ms: 1_000,
            stale_after_ms: 5_000,
        }
    }
}

/// Journal settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// File name inside the data directory
    pub file_name: String,
    /// Background flush period
    pub flush_interval_ms: u64,
    /// Buffer size for writes
    pub write_buffer_size: usize,
    /// fdatasync on every flush
    pub sync_on_flush: bool,
    /// Size past which the journal is truncated once no insert is in
    /// flight, 0 to keep it until the next open
    pub compact_threshold_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file_name: "journal.log".to_string(),
            flush_interval_ms: 10,
            write_buffer_size: 64 * 1024, // 64KB
            sync_on_flush: true,
            compact_threshold_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Index settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeConfig {
    /// Maximum children per node; a node holds at most `order - 1` entries
    pub order: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self { order: 64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
        EngineConfig::in_memory().validate().unwrap();
    }

    #[test]
    fn test_rejects_tiny_order() {
        let mut config = EngineConfig::default();
        config.btree.order = 2;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_order_past_entry_count_width() {
        let mut config = EngineConfig::default();
        config.btree.order = u16::MAX as usize;
        config.validate().unwrap();
        config.btree.order = u16::MAX as usize + 1;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_paths_follow_backend() {
        let config = EngineConfig::at("/tmp/x", StoreBackend::Redb);
        assert_eq!(config.page_store_path(), PathBuf::from("/tmp/x/pages.redb"));
        assert_eq!(config.journal_path(), PathBuf::from("/tmp/x/journal.log"));
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("REDB".parse::<StoreBackend>().unwrap(), StoreBackend::Redb);
        assert!("tape".parse::<StoreBackend>().is_err());
    }
}
