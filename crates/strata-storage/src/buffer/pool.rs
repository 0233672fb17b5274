use super::{BufferedPage, PoolStats, PoolStatsSnapshot};
use crate::codec::{Decoder, Encoder};
use crate::journal::JournalWriter;
use crate::page::{PAGE_PAYLOAD_CAPACITY, Page, page_key};
use crate::store::PageStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{BufferPoolConfig, Error, Result};
use tracing::{debug, info, warn};

/// Header page magic ("STRA")
const HEADER_MAGIC: u32 = 0x4152_5453;

/// Header payload version
const HEADER_VERSION: u16 = 1;

/// Offset of the reserved header page
pub const HEADER_OFFSET: u64 = 0;

/// Persistent pool counters stored in page 0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolHeader {
    pub next_row_id: u64,
    pub next_free_offset: u64,
    pub catalog_offset: u64,
}

impl Default for PoolHeader {
    fn default() -> Self {
        Self {
            next_row_id: 1,
            next_free_offset: 1,
            catalog_offset: 0,
        }
    }
}

impl PoolHeader {
    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(30);
        enc.put_u32(HEADER_MAGIC);
        enc.put_u16(HEADER_VERSION);
        enc.put_u64(self.next_row_id);
        enc.put_u64(self.next_free_offset);
        enc.put_u64(self.catalog_offset);
        enc.finish()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let magic = dec.get_u32()?;
        if magic != HEADER_MAGIC {
            return Err(Error::storage(format!(
                "invalid pool header magic {magic:#010x}"
            )));
        }
        let version = dec.get_u16()?;
        if version != HEADER_VERSION {
            return Err(Error::storage(format!(
                "unsupported pool header version {version}"
            )));
        }
        Ok(Self {
            next_row_id: dec.get_u64()?,
            next_free_offset: dec.get_u64()?,
            catalog_offset: dec.get_u64()?,
        })
    }
}

/// Page cache over a page store
pub struct BufferPool {
    store: Arc<dyn PageStore>,
    pub(super) pages: DashMap<u64, Arc<BufferedPage>>,
    next_row_id: AtomicU64,
    next_free_offset: AtomicU64,
    catalog_offset: AtomicU64,
    /// Serializes flushes so dirty-flag bookkeeping stays consistent
    flush_lock: Mutex<()>,
    /// Flushed ahead of any page that carries a journal sequence
    journal: OnceLock<Arc<JournalWriter>>,
    pub(super) config: BufferPoolConfig,
    pub(super) stats: PoolStats,
}

impl BufferPool {
    /// Open the pool, loading counters from the header page
    pub fn open(store: Arc<dyn PageStore>, config: BufferPoolConfig) -> Result<Self> {
        let header = match store.read(&page_key(HEADER_OFFSET))? {
            Some(bytes) => {
                let page = Page::from_bytes(HEADER_OFFSET, &bytes)?;
                if page.is_blank() {
                    PoolHeader::default()
                } else {
                    PoolHeader::decode(page.payload())?
                }
            }
            None => PoolHeader::default(),
        };

        info!(
            backend = store.name(),
            next_row_id = header.next_row_id,
            next_free_offset = header.next_free_offset,
            "Opened buffer pool"
        );

        Ok(Self {
            store,
            pages: DashMap::new(),
            next_row_id: AtomicU64::new(header.next_row_id),
            next_free_offset: AtomicU64::new(header.next_free_offset),
            catalog_offset: AtomicU64::new(header.catalog_offset),
            flush_lock: Mutex::new(()),
            journal: OnceLock::new(),
            config,
            stats: PoolStats::default(),
        })
    }

    fn check_offset(offset: u64) -> Result<()> {
        if offset == HEADER_OFFSET {
            return Err(Error::InvalidArgument(
                "page 0 is reserved for the pool header".into(),
            ));
        }
        if offset > u64::from(u32::MAX) {
            return Err(Error::PageOutOfRange { offset });
        }
        Ok(())
    }

    fn entry(&self, offset: u64) -> Arc<BufferedPage> {
        if let Some(page) = self.pages.get(&offset) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(page.value());
        }
        Arc::clone(
            self.pages
                .entry(offset)
                .or_insert_with(|| Arc::new(BufferedPage::new(offset)))
                .value(),
        )
    }

    /// Materialize a page without loading it, for callers that overwrite it
    pub fn get_page(&self, offset: u64) -> Result<Arc<BufferedPage>> {
        Self::check_offset(offset)?;
        let page = self.entry(offset);
        if !page.loaded.load(Ordering::Acquire) {
            let _frame = page.frame.lock();
            page.loaded.store(true, Ordering::Release);
        }
        Ok(page)
    }

    /// Materialize a page, loading it from the store on first touch
    pub fn read_page(&self, offset: u64) -> Result<Arc<BufferedPage>> {
        Self::check_offset(offset)?;
        let page = self.entry(offset);
        if !page.loaded.load(Ordering::Acquire) {
            let mut frame = page.frame.lock();
            if !page.loaded.load(Ordering::Acquire) {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(bytes) = self.store.read(&page_key(offset))? {
                    *frame = Page::from_bytes(offset, &bytes)?;
                }
                page.loaded.store(true, Ordering::Release);
            }
        }
        Ok(page)
    }

    /// Write a payload starting at `offset`, chaining overflow pages
    ///
    /// An existing chain is reused; extra pages are allocated from the free
    /// offset counter. The pages are dirty in memory when this returns.
    pub fn write_data_to_page(&self, offset: u64, data: &[u8], seq: u32) -> Result<()> {
        let mut chunks = data.chunks(PAGE_PAYLOAD_CAPACITY).peekable();
        let mut current = offset;
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(current) {
                return Err(Error::internal(format!(
                    "overflow chain starting at page {offset} loops at {current}"
                )));
            }
            let chunk = chunks.next().unwrap_or(&[]);
            let page = self.read_page(current)?;
            let mut frame = page.lock();
            frame.set_payload(chunk, seq)?;
            let next = if chunks.peek().is_some() {
                match u64::from(frame.next_page()) {
                    0 => self.next_free_offset(),
                    existing => existing,
                }
            } else {
                0
            };
            frame.set_next_page(next as u32);
            page.mark_dirty();
            drop(frame);

            if next == 0 {
                return Ok(());
            }
            current = next;
        }
    }

    /// Read a payload, following the overflow chain
    pub fn read_data(&self, offset: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut current = offset;
        let mut visited = HashSet::new();
        while current != 0 {
            if !visited.insert(current) {
                return Err(Error::internal(format!(
                    "overflow chain starting at page {offset} loops at {current}"
                )));
            }
            let page = self.read_page(current)?;
            let frame = page.lock();
            out.extend_from_slice(frame.payload());
            current = u64::from(frame.next_page());
        }
        Ok(out)
    }

    /// Apply several single-page writes as one unit
    ///
    /// All frames are locked in offset order before any is modified, so
    /// readers see either none or all of the batch.
    pub fn apply_batch(&self, ops: &[(u64, Vec<u8>)], seq: u32) -> Result<()> {
        for (offset, data) in ops {
            if data.len() > PAGE_PAYLOAD_CAPACITY {
                return Err(Error::InvalidArgument(format!(
                    "batched write to page {offset} spans more than one page"
                )));
            }
        }

        let mut offsets: Vec<u64> = ops.iter().map(|(offset, _)| *offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        let pages = offsets
            .iter()
            .map(|offset| self.read_page(*offset))
            .collect::<Result<Vec<_>>>()?;

        let mut guards: Vec<_> = pages.iter().map(|page| page.lock()).collect();
        for (offset, data) in ops {
            let idx = offsets
                .binary_search(offset)
                .map_err(|_| Error::internal("batched page vanished"))?;
            let frame = &mut guards[idx];
            frame.set_payload(data, seq)?;
            frame.set_next_page(0);
        }
        drop(guards);

        for page in &pages {
            page.mark_dirty();
        }
        debug!(pages = pages.len(), seq, "Applied page batch");
        Ok(())
    }

    /// Write every dirty page and the header to the store
    pub fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();

        // Collect first: frames must not be locked while a map shard is held
        let flushed: Vec<Arc<BufferedPage>> = self
            .pages
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut ops = Vec::with_capacity(flushed.len() + 1);
        let mut max_seq = 0;
        for page in &flushed {
            let frame = page.frame.lock();
            page.dirty.store(false, Ordering::Release);
            max_seq = max_seq.max(frame.last_seq());
            ops.push((page_key(page.offset), frame.as_bytes().to_vec()));
        }

        // a page's journal record reaches disk before the page does
        if max_seq > 0 {
            if let Some(journal) = self.journal.get() {
                if let Err(e) = journal.flush() {
                    for page in &flushed {
                        page.mark_dirty();
                    }
                    return Err(e);
                }
            }
        }

        let mut header_page = Page::empty();
        header_page.set_payload(&self.header().encode(), 0)?;
        ops.push((page_key(HEADER_OFFSET), header_page.as_bytes().to_vec()));

        let result = self
            .store
            .batch_write(&ops)
            .and_then(|()| self.store.sync());
        if let Err(e) = result {
            warn!(error = %e, pages = flushed.len(), "Buffer pool flush failed");
            for page in &flushed {
                page.mark_dirty();
            }
            return Err(e);
        }

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .pages_written
            .fetch_add(flushed.len() as u64, Ordering::Relaxed);
        debug!(pages = flushed.len(), "Flushed buffer pool");
        Ok(flushed.len())
    }

    /// Journal to flush before writing journaled pages; set once
    pub fn attach_journal(&self, journal: Arc<JournalWriter>) {
        if self.journal.set(journal).is_err() {
            warn!("Buffer pool already has a journal attached");
        }
    }

    /// Allocate a row id
    pub fn next_row_id(&self) -> u64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a page number
    pub fn next_free_offset(&self) -> u64 {
        self.next_free_offset.fetch_add(1, Ordering::SeqCst)
    }

    /// Move both counters past an allocation found in the journal
    pub fn reserve_allocated(&self, row_id: u64, page_offset: u64) {
        self.next_row_id
            .fetch_max(row_id.saturating_add(1), Ordering::SeqCst);
        self.next_free_offset
            .fetch_max(page_offset.saturating_add(1), Ordering::SeqCst);
    }

    /// Page chain holding the catalog, 0 if none
    pub fn catalog_offset(&self) -> u64 {
        self.catalog_offset.load(Ordering::Acquire)
    }

    pub fn set_catalog_offset(&self, offset: u64) {
        self.catalog_offset.store(offset, Ordering::Release);
    }

    /// Current header values
    pub fn header(&self) -> PoolHeader {
        PoolHeader {
            next_row_id: self.next_row_id.load(Ordering::SeqCst),
            next_free_offset: self.next_free_offset.load(Ordering::SeqCst),
            catalog_offset: self.catalog_offset(),
        }
    }

    /// Pages currently cached
    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    /// Pages waiting for a flush
    pub fn dirty_pages(&self) -> usize {
        self.pages.iter().filter(|e| e.value().is_dirty()).count()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryPageStore, MmapPageStore};
    use tempfile::tempdir;

    fn memory_pool() -> BufferPool {
        BufferPool::open(Arc::new(MemoryPageStore::new()), BufferPoolConfig::default()).unwrap()
    }

    #[test]
    fn test_write_then_read_in_memory() {
        let pool = memory_pool();
        let offset = pool.next_free_offset();
        pool.write_data_to_page(offset, b"row bytes", 4).unwrap();
        assert_eq!(pool.read_data(offset).unwrap(), b"row bytes");
        assert_eq!(pool.dirty_pages(), 1);

        // nothing reaches the store until flush
        assert!(pool.store().read(&page_key(offset)).unwrap().is_none());
        assert_eq!(pool.flush().unwrap(), 1);
        assert_eq!(pool.dirty_pages(), 0);
        assert!(pool.store().read(&page_key(offset)).unwrap().is_some());
    }

    #[test]
    fn test_overflow_chain_reused() {
        let pool = memory_pool();
        let offset = pool.next_free_offset();
        let big: Vec<u8> = (0..PAGE_PAYLOAD_CAPACITY * 2 + 10)
            .map(|i| (i % 251) as u8)
            .collect();
        pool.write_data_to_page(offset, &big, 1).unwrap();
        assert_eq!(pool.read_data(offset).unwrap(), big);
        let after_first = pool.header().next_free_offset;

        let rewritten: Vec<u8> = big.iter().map(|b| b.wrapping_add(1)).collect();
        pool.write_data_to_page(offset, &rewritten, 2).unwrap();
        assert_eq!(pool.read_data(offset).unwrap(), rewritten);
        assert_eq!(pool.header().next_free_offset, after_first);

        let smaller = vec![7u8; PAGE_PAYLOAD_CAPACITY + 1];
        pool.write_data_to_page(offset, &smaller, 3).unwrap();
        assert_eq!(pool.read_data(offset).unwrap(), smaller);
    }

    #[test]
    fn test_header_and_pages_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.dat");
        let (offset, row_id) = {
            let store: Arc<dyn PageStore> = Arc::new(MmapPageStore::open(&path).unwrap());
            let pool = BufferPool::open(store, BufferPoolConfig::default()).unwrap();
            let offset = pool.next_free_offset();
            let row_id = pool.next_row_id();
            pool.set_catalog_offset(77);
            pool.write_data_to_page(offset, b"persisted", 9).unwrap();
            pool.flush().unwrap();
            (offset, row_id)
        };

        let store: Arc<dyn PageStore> = Arc::new(MmapPageStore::open(&path).unwrap());
        let pool = BufferPool::open(store, BufferPoolConfig::default()).unwrap();
        assert_eq!(pool.read_data(offset).unwrap(), b"persisted");
        assert_eq!(pool.next_row_id(), row_id + 1);
        assert_eq!(pool.catalog_offset(), 77);
        assert_eq!(pool.read_page(offset).unwrap().snapshot().last_seq(), 9);
    }

    #[test]
    fn test_corrupt_page_reported() {
        let store = Arc::new(MemoryPageStore::new());
        let mut page = Page::empty();
        page.set_payload(b"abc", 1).unwrap();
        let mut raw = page.as_bytes().to_vec();
        raw[27] ^= 1;
        store.write(&page_key(5), &raw).unwrap();

        let pool = BufferPool::open(store, BufferPoolConfig::default()).unwrap();
        let err = pool.read_page(5).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { offset: 5, .. }));
    }

    #[test]
    fn test_header_page_reserved() {
        let pool = memory_pool();
        assert!(pool.read_page(HEADER_OFFSET).is_err());
        assert!(pool.get_page(HEADER_OFFSET).is_err());
    }

    #[test]
    fn test_apply_batch() {
        let pool = memory_pool();
        let a = pool.next_free_offset();
        let b = pool.next_free_offset();
        pool.apply_batch(&[(b, b"second".to_vec()), (a, b"first".to_vec())], 5)
            .unwrap();
        assert_eq!(pool.read_data(a).unwrap(), b"first");
        assert_eq!(pool.read_data(b).unwrap(), b"second");

        let too_big = vec![0u8; PAGE_PAYLOAD_CAPACITY + 1];
        assert!(pool.apply_batch(&[(a, too_big)], 6).is_err());
        assert_eq!(pool.read_data(a).unwrap(), b"first");
    }

    #[test]
    fn test_concurrent_first_touch_loads_once() {
        let store = Arc::new(MemoryPageStore::new());
        let mut page = Page::empty();
        page.set_payload(b"shared", 1).unwrap();
        store.write(&page_key(3), page.as_bytes()).unwrap();

        let pool = Arc::new(BufferPool::open(store, BufferPoolConfig::default()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.read_page(3).unwrap())
            })
            .collect();
        let pages: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for page in &pages[1..] {
            assert!(Arc::ptr_eq(&pages[0], page));
        }
        assert_eq!(pool.stats().misses, 1);
        assert_eq!(pool.read_data(3).unwrap(), b"shared");
    }

    #[test]
    fn test_reserve_allocated_only_moves_forward() {
        let pool = BufferPool::open(Arc::new(MemoryPageStore::new()), BufferPoolConfig::default())
            .unwrap();
        pool.reserve_allocated(10, 20);
        assert_eq!(pool.next_row_id(), 11);
        assert_eq!(pool.next_free_offset(), 21);
        pool.reserve_allocated(3, 4);
        assert_eq!(pool.header().next_row_id, 12);
        assert_eq!(pool.header().next_free_offset, 22);
    }

    #[test]
    fn test_flush_pushes_journal_first() {
        use crate::journal::{JournalReader, JournalRecord};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let journal = Arc::new(
            JournalWriter::open(&path, strata_common::JournalConfig::default()).unwrap(),
        );
        let pool = BufferPool::open(Arc::new(MemoryPageStore::new()), BufferPoolConfig::default())
            .unwrap();
        pool.attach_journal(Arc::clone(&journal));

        let seq = journal.append(JournalRecord::insert_checkpoint(1)).unwrap();
        pool.write_data_to_page(5, b"logged", seq).unwrap();
        assert_eq!(JournalReader::open(&path).unwrap().count(), 0);

        pool.flush().unwrap();
        assert_eq!(JournalReader::open(&path).unwrap().count(), 1);
    }
}
