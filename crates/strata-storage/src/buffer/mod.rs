//! Buffer pool
//!
//! Sharded, lazily populated page cache over a [`PageStore`](crate::store::PageStore).
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 BufferPool                   │
//! │  DashMap<offset, Arc<BufferedPage>>          │
//! │    • entry created at most once per offset   │
//! │    • per-page mutex guards the frame         │
//! │    • loaded flag checked twice around load   │
//! │                      │                       │
//! │  header page (offset 0)                      │
//! │    next_row_id / next_free_offset / catalog  │
//! └──────────────────────┼───────────────────────┘
//!                        │ flush (dirty pages + header)
//!                  ┌─────┴─────┐
//!                  │ PageStore │
//!                  └───────────┘
//! ```
//!
//! Eviction never happens on the read/write path; the collector in
//! [`gc`] runs on a timer.

mod gc;
mod pool;

pub use pool::{BufferPool, PoolHeader};

use crate::page::Page;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A cached page and its bookkeeping
pub struct BufferedPage {
    offset: u64,
    frame: Mutex<Page>,
    loaded: AtomicBool,
    dirty: AtomicBool,
    last_access_ms: AtomicU64,
    access_count: AtomicU64,
}

impl BufferedPage {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            frame: Mutex::new(Page::empty()),
            loaded: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            last_access_ms: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        }
    }

    /// Page number
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Exclusive access to the frame
    pub fn lock(&self) -> MutexGuard<'_, Page> {
        self.touch();
        self.frame.lock()
    }

    /// Copy of the current frame
    pub fn snapshot(&self) -> Page {
        self.lock().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_access_ms.store(now_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BufferedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedPage")
            .field("offset", &self.offset)
            .field("loaded", &self.loaded.load(Ordering::Relaxed))
            .field("dirty", &self.is_dirty())
            .field("access_count", &self.access_count())
            .finish()
    }
}

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub flushes: AtomicU64,
    pub pages_written: AtomicU64,
}

impl PoolStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Clone, Debug, serde::Serialize)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub pages_written: u64,
    pub hit_ratio: f64,
}
