use super::PageStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use strata_common::{ObjectId, Result};

/// Volatile page store
#[derive(Default)]
pub struct MemoryPageStore {
    pages: RwLock<HashMap<ObjectId, Vec<u8>>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pages
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}

impl PageStore for MemoryPageStore {
    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.read().get(id).cloned())
    }

    fn write(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.pages.write().insert(*id, data.to_vec());
        Ok(())
    }

    fn batch_write(&self, ops: &[(ObjectId, Vec<u8>)]) -> Result<()> {
        let mut pages = self.pages.write();
        for (id, data) in ops {
            pages.insert(*id, data.clone());
        }
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<()> {
        self.pages.write().remove(id);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
