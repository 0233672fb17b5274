//! Page stores
//!
//! The system of record for pages. A store maps a 12-byte key to one page
//! image; the buffer pool is the only caller.
//!
//! Backends:
//! - **memory**: process-local map, for tests and scratch engines
//! - **mmap**: one file of concatenated pages, keyed by slot id
//! - **redb**: embedded key-value store, one table of page images

mod memory;
mod mmap;
mod redb_store;

pub use memory::MemoryPageStore;
pub use mmap::MmapPageStore;
pub use redb_store::RedbPageStore;

use std::sync::Arc;
use strata_common::{EngineConfig, ObjectId, Result, StoreBackend};
use tracing::info;

/// Raw page storage keyed by object id
pub trait PageStore: Send + Sync {
    /// Read one page image, `None` if it was never written
    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>>;

    /// Write one page image
    fn write(&self, id: &ObjectId, data: &[u8]) -> Result<()>;

    /// Write several page images as one unit
    fn batch_write(&self, ops: &[(ObjectId, Vec<u8>)]) -> Result<()>;

    /// Remove a page
    fn delete(&self, id: &ObjectId) -> Result<()>;

    /// Make all writes durable
    fn sync(&self) -> Result<()>;

    /// Backend name for logs and stats
    fn name(&self) -> &'static str;
}

/// Open the store selected by the configuration
pub fn open_store(config: &EngineConfig) -> Result<Arc<dyn PageStore>> {
    let backend = config.storage.backend;
    if backend != StoreBackend::Memory {
        std::fs::create_dir_all(&config.storage.data_dir)?;
    }
    let store: Arc<dyn PageStore> = match backend {
        StoreBackend::Memory => Arc::new(MemoryPageStore::new()),
        StoreBackend::Mmap => Arc::new(MmapPageStore::open(config.page_store_path())?),
        StoreBackend::Redb => Arc::new(RedbPageStore::open(config.page_store_path())?),
    };
    info!(backend = store.name(), dir = %config.storage.data_dir.display(), "Opened page store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use tempfile::tempdir;

    fn exercise(store: &dyn PageStore) {
        let a = ObjectId::from_slot(1);
        let b = ObjectId::from_slot(3);
        assert!(store.read(&a).unwrap().is_none());

        store.write(&a, &[7u8; PAGE_SIZE]).unwrap();
        assert_eq!(store.read(&a).unwrap().unwrap(), vec![7u8; PAGE_SIZE]);

        store
            .batch_write(&[(a, vec![1u8; PAGE_SIZE]), (b, vec![2u8; PAGE_SIZE])])
            .unwrap();
        assert_eq!(store.read(&a).unwrap().unwrap()[0], 1);
        assert_eq!(store.read(&b).unwrap().unwrap()[0], 2);

        store.delete(&a).unwrap();
        assert!(store.read(&a).unwrap().is_none());
        store.sync().unwrap();
    }

    #[test]
    fn test_all_backends_share_semantics() {
        let dir = tempdir().unwrap();
        exercise(&MemoryPageStore::new());
        exercise(&MmapPageStore::open(dir.path().join("pages.dat")).unwrap());
        exercise(&RedbPageStore::open(dir.path().join("pages.redb")).unwrap());
    }

    #[test]
    fn test_open_store_from_config() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::at(dir.path(), StoreBackend::Redb);
        let store = open_store(&config).unwrap();
        assert_eq!(store.name(), "redb");
        assert!(config.page_store_path().exists());
    }
}
