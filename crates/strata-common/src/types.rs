//! Core type definitions for Strata
//!
//! Identifiers used for rows, pages and anything else that crosses an API or
//! journal boundary.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Size of an [`ObjectId`] in bytes
pub const OBJECT_ID_LEN: usize = 12;

/// Counter space of the trailing three bytes
const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Per-process random salt, fixed on first use
fn process_salt() -> &'static [u8; 5] {
    static SALT: OnceLock<[u8; 5]> = OnceLock::new();
    SALT.get_or_init(rand::random)
}

/// Monotonic counter, seeded randomly so restarts do not reuse low values
fn process_counter() -> &'static AtomicU32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    COUNTER.get_or_init(|| AtomicU32::new(rand::random::<u32>() & COUNTER_MASK))
}

/// 12-byte object identifier
///
/// Layout of generated ids:
/// ```text
/// +-------------+----------------+-------------+
/// | epoch secs  | process salt   | counter     |
/// | 4B (BE)     | 5B             | 3B (BE)     |
/// +-------------+----------------+-------------+
/// ```
///
/// Slot ids (see [`ObjectId::from_slot`]) carry a plain 64-bit number instead
/// and are used for page offsets and row numbers. Equality and ordering are
/// byte-wise.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, From, Into,
)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// The all-zero id, used as the "unset" sentinel
    pub const NIL: Self = Self([0u8; OBJECT_ID_LEN]);

    /// Generate a new id from time, process salt and counter
    #[must_use]
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let counter = process_counter().fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;

        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process_salt());
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    /// Build a deterministic id wrapping a 64-bit slot number
    #[must_use]
    pub fn from_slot(slot: u64) -> Self {
        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes[4..12].copy_from_slice(&slot.to_be_bytes());
        Self(bytes)
    }

    /// Recover the slot number of an id built with [`ObjectId::from_slot`]
    #[must_use]
    pub fn slot(&self) -> Option<u64> {
        if self.0[0..4] == [0u8; 4] {
            Some(u64::from_be_bytes(self.0[4..12].try_into().ok()?))
        } else {
            None
        }
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice of exactly 12 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; OBJECT_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!("object id must be 12 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(raw))
    }

    /// Parse the 24-character hex form
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s)
            .map_err(|e| Error::InvalidArgument(format!("invalid object id '{s}': {e}")))?;
        Self::from_slice(&decoded)
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Epoch seconds embedded in a generated id
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// True for the all-zero sentinel
    #[must_use]
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Row locator: where a row's primary slot and latest data page live
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RowLocator {
    /// Row id slot
    pub row_id: ObjectId,
    /// Data page holding the row payload
    pub data_page: ObjectId,
}

impl RowLocator {
    /// Sentinel before allocation
    pub const UNSET: Self = Self {
        row_id: ObjectId::NIL,
        data_page: ObjectId::NIL,
    };

    /// Serialized size in bytes
    pub const ENCODED_LEN: usize = OBJECT_ID_LEN * 2;

    /// Create a locator from its two ids
    #[must_use]
    pub const fn new(row_id: ObjectId, data_page: ObjectId) -> Self {
        Self { row_id, data_page }
    }

    /// Build a locator from a row number and a page offset
    #[must_use]
    pub fn from_slots(row_id: u64, page_offset: u64) -> Self {
        Self::new(ObjectId::from_slot(row_id), ObjectId::from_slot(page_offset))
    }

    /// True once both halves are allocated
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !self.row_id.is_nil() && !self.data_page.is_nil()
    }

    /// Page offset of the data page, if it is a slot id
    #[must_use]
    pub fn page_offset(&self) -> Option<u64> {
        self.data_page.slot()
    }
}

impl fmt::Debug for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowLocator({}, {})", self.row_id, self.data_page)
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row_id, self.data_page)
    }
}
