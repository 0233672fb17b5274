//! Strata Storage - Page-level storage for the Strata engine
//!
//! This crate provides:
//! - Page format with CRC32C checksums and overflow chaining
//! - Page stores (memory, memory-mapped file, redb)
//! - Buffer pool with background eviction
//! - Page-backed B-tree indexes
//! - Write-ahead journal (writer, reader, verifier)

pub mod btree;
pub mod buffer;
pub mod codec;
pub mod journal;
pub mod page;
pub mod store;
pub mod value;

pub use btree::{BTree, LocatorList, NodeValue, TreeCheck};
pub use buffer::{BufferPool, BufferedPage, PoolHeader, PoolStatsSnapshot};
pub use journal::{
    IncompleteGroup, JournalReader, JournalRecord, JournalVerifier, JournalWriter, RecordKind,
};
pub use page::{PAGE_PAYLOAD_CAPACITY, PAGE_SIZE, Page};
pub use store::{MemoryPageStore, MmapPageStore, PageStore, RedbPageStore, open_store};
pub use value::{IndexKey, Value};
