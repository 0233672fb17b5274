use super::PageStore;
use crate::page::PAGE_SIZE;
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use strata_common::{Error, ObjectId, Result};
use tracing::debug;

/// Pages added per file extension
const GROW_STEP_PAGES: u64 = 64;

struct MappedFile {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MappedFile {
    fn map(file: File, page_count: u64) -> Result<Self> {
        // SAFETY: the file is opened read+write by this process only and the
        // mapping lives inside the store, which is the single accessor. All
        // access is bounds-checked against `page_count`, and remapping takes
        // the store's write lock so no slice outlives the old mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    fn range(slot: u64) -> std::ops::Range<usize> {
        let start = slot as usize * PAGE_SIZE;
        start..start + PAGE_SIZE
    }
}

/// Page store over a memory-mapped file of concatenated pages
///
/// Keys must be slot ids (see [`ObjectId::from_slot`]); the slot is the page
/// number inside the file. Deleted pages are zeroed and read back as absent.
pub struct MmapPageStore {
    path: PathBuf,
    inner: RwLock<MappedFile>,
}

impl MmapPageStore {
    /// Open the page file, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(Error::storage(format!(
                "page file '{}' size {len} is not a multiple of {PAGE_SIZE}",
                path.display()
            )));
        }
        if len == 0 {
            len = GROW_STEP_PAGES * PAGE_SIZE as u64;
            file.set_len(len)?;
        }

        let mapped = MappedFile::map(file, len / PAGE_SIZE as u64)?;
        debug!(path = %path.display(), pages = mapped.page_count, "Mapped page file");
        Ok(Self {
            path,
            inner: RwLock::new(mapped),
        })
    }

    fn slot(id: &ObjectId) -> Result<u64> {
        id.slot()
            .ok_or_else(|| Error::InvalidArgument(format!("mmap store needs a slot id, got {id}")))
    }

    fn ensure_capacity(&self, slot: u64) -> Result<()> {
        if slot < self.inner.read().page_count {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if slot < inner.page_count {
            return Ok(());
        }
        let new_count = (slot / GROW_STEP_PAGES + 1) * GROW_STEP_PAGES;
        inner.mmap.flush()?;
        inner.file.set_len(new_count * PAGE_SIZE as u64)?;
        let file = inner.file.try_clone()?;
        *inner = MappedFile::map(file, new_count)?;
        debug!(path = %self.path.display(), pages = new_count, "Grew page file");
        Ok(())
    }

    /// Pages currently backed by the file
    pub fn page_count(&self) -> u64 {
        self.inner.read().page_count
    }
}

impl PageStore for MmapPageStore {
    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        let slot = Self::slot(id)?;
        let inner = self.inner.read();
        if slot >= inner.page_count {
            return Ok(None);
        }
        let bytes = &inner.mmap[MappedFile::range(slot)];
        if bytes.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }

    fn write(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "page image must be {PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let slot = Self::slot(id)?;
        self.ensure_capacity(slot)?;
        let mut inner = self.inner.write();
        inner.mmap[MappedFile::range(slot)].copy_from_slice(data);
        Ok(())
    }

    fn batch_write(&self, ops: &[(ObjectId, Vec<u8>)]) -> Result<()> {
        let mut max_slot = 0;
        for (id, data) in ops {
            if data.len() != PAGE_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "page image must be {PAGE_SIZE} bytes, got {}",
                    data.len()
                )));
            }
            max_slot = max_slot.max(Self::slot(id)?);
        }
        self.ensure_capacity(max_slot)?;
        let mut inner = self.inner.write();
        for (id, data) in ops {
            let slot = Self::slot(id)?;
            inner.mmap[MappedFile::range(slot)].copy_from_slice(data);
        }
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<()> {
        let slot = Self::slot(id)?;
        let mut inner = self.inner.write();
        if slot < inner.page_count {
            inner.mmap[MappedFile::range(slot)].fill(0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.inner.read().mmap.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_grows_in_steps_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.dat");
        {
            let store = MmapPageStore::open(&path).unwrap();
            assert_eq!(store.page_count(), GROW_STEP_PAGES);
            store
                .write(&ObjectId::from_slot(GROW_STEP_PAGES + 5), &[9u8; PAGE_SIZE])
                .unwrap();
            assert_eq!(store.page_count(), GROW_STEP_PAGES * 2);
            store.sync().unwrap();
        }
        let store = MmapPageStore::open(&path).unwrap();
        let page = store.read(&ObjectId::from_slot(GROW_STEP_PAGES + 5)).unwrap();
        assert_eq!(page.unwrap()[100], 9);
    }

    #[test]
    fn test_rejects_non_slot_keys() {
        let dir = tempdir().unwrap();
        let store = MmapPageStore::open(dir.path().join("pages.dat")).unwrap();
        assert!(store.read(&ObjectId::new()).is_err());
        assert!(store.write(&ObjectId::from_slot(1), &[0u8; 10]).is_err());
    }
}
