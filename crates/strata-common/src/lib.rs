//! Strata Common - Shared types and utilities
//!
//! This crate provides the identifiers, clock, error definitions and
//! configuration used across all Strata components.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{HlcClock, HlcTimestamp};
pub use config::{
    BTreeConfig, BufferPoolConfig, EngineConfig, JournalConfig, StorageConfig, StoreBackend,
};
pub use error::{Error, Result};
pub use types::*;
