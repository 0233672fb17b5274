//! Background page eviction

use super::{BufferPool, BufferedPage, now_millis};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

impl BufferPool {
    /// Evict clean, unpinned, stale pages while over the high-water mark
    ///
    /// Candidates are ordered by access count, then last access. A page whose
    /// frame is locked, that is dirty, or that someone else holds a handle to
    /// is skipped. Returns the number of evicted pages.
    pub fn collect_garbage(&self) -> usize {
        let cached = self.pages.len();
        if cached <= self.config.high_water_pages {
            return 0;
        }

        let now = now_millis();
        let stale_before = now.saturating_sub(self.config.stale_after_ms);
        let mut candidates: Vec<(u64, u64, u64)> = self
            .pages
            .iter()
            .filter(|entry| {
                let page = entry.value();
                !page.is_dirty() && page.last_access_ms() <= stale_before
            })
            .map(|entry| {
                let page = entry.value();
                (page.access_count(), page.last_access_ms(), *entry.key())
            })
            .collect();
        candidates.sort_unstable();

        let target = cached - self.config.low_water_pages.min(cached);
        let mut evicted = 0;
        for (_, _, offset) in candidates {
            if evicted >= target {
                break;
            }
            let removed = self.pages.remove_if(&offset, |_, page| evictable(page));
            if removed.is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = self.pages.len(), "Evicted buffered pages");
        }
        evicted
    }

    /// Run [`collect_garbage`](Self::collect_garbage) on a fixed timer
    ///
    /// The task stops once the pool is dropped.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.gc_interval_ms.max(1));
        info!(interval_ms = interval.as_millis() as u64, "Starting buffer pool collector");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.collect_garbage();
            }
        })
    }
}

/// Checked under the map shard lock, so no new handle can be taken meanwhile
fn evictable(page: &Arc<BufferedPage>) -> bool {
    if Arc::strong_count(page) > 1 || page.is_dirty() {
        return false;
    }
    page.frame.try_lock().is_some()
}

#[cfg(test)]
mod tests {
    use crate::buffer::BufferPool;
    use crate::store::MemoryPageStore;
    use std::sync::Arc;
    use strata_common::BufferPoolConfig;

    fn small_pool() -> BufferPool {
        let config = BufferPoolConfig {
            high_water_pages: 8,
            low_water_pages: 4,
            gc_interval_ms: 5,
            stale_after_ms: 0,
        };
        BufferPool::open(Arc::new(MemoryPageStore::new()), config).unwrap()
    }

    #[test]
    fn test_under_high_water_is_noop() {
        let pool = small_pool();
        for _ in 0..8 {
            let offset = pool.next_free_offset();
            pool.write_data_to_page(offset, b"x", 1).unwrap();
        }
        pool.flush().unwrap();
        assert_eq!(pool.collect_garbage(), 0);
    }

    #[test]
    fn test_evicts_clean_pages_down_to_low_water() {
        let pool = small_pool();
        let offsets: Vec<u64> = (0..12).map(|_| pool.next_free_offset()).collect();
        for offset in &offsets {
            pool.write_data_to_page(*offset, &offset.to_le_bytes(), 1).unwrap();
        }

        // dirty pages are never evicted
        assert_eq!(pool.collect_garbage(), 0);

        pool.flush().unwrap();
        assert_eq!(pool.collect_garbage(), 8);
        assert_eq!(pool.cached_pages(), 4);

        // evicted pages reload from the store
        for offset in &offsets {
            assert_eq!(pool.read_data(*offset).unwrap(), offset.to_le_bytes());
        }
    }

    #[test]
    fn test_pinned_pages_survive() {
        let pool = small_pool();
        let offsets: Vec<u64> = (0..10).map(|_| pool.next_free_offset()).collect();
        for offset in &offsets {
            pool.write_data_to_page(*offset, b"p", 1).unwrap();
        }
        pool.flush().unwrap();

        let pinned: Vec<_> = offsets.iter().map(|o| pool.read_page(*o).unwrap()).collect();
        assert_eq!(pool.collect_garbage(), 0);
        drop(pinned);
        assert_eq!(pool.collect_garbage(), 6);
    }

    #[tokio::test]
    async fn test_background_collector() {
        let pool = Arc::new(small_pool());
        for _ in 0..12 {
            let offset = pool.next_free_offset();
            pool.write_data_to_page(offset, b"bg", 1).unwrap();
        }
        pool.flush().unwrap();

        let handle = pool.spawn_gc();
        for _ in 0..100 {
            if pool.cached_pages() <= 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(pool.cached_pages() <= 4);
        assert!(pool.stats().evictions >= 8);
        handle.abort();
    }
}
