//! Strata Engine - Transactional layer of the Strata storage engine
//!
//! This crate provides:
//! - Flux step-machine for multi-step operations with an abort path
//! - Schema catalog of tables and their index trees
//! - Journaled insert pipeline and crash recovery
//! - Transactions with buffered deltas, applied at commit
//! - The [`Engine`] facade tying them together

pub mod catalog;
pub mod engine;
pub mod flux;
pub mod insert;
pub mod txn;

pub use catalog::{Catalog, ColumnSchema, IndexKind, IndexTree, TableHandle, TableIndexSchema, TableSchema};
pub use engine::{Engine, EngineStats, IndexStats, TableStats};
pub use flux::{AbortCause, Flux, FluxOutcome, FluxStep, StepOutcome};
pub use insert::{InsertPipeline, InsertRecoverer, InsertStep, InsertTicket, RecoveryReport, Row};
pub use txn::{Transaction, TransactionManager, TxnStatus};
