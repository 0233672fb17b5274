//! Write-ahead journal
//!
//! Append-only log of typed records with:
//! - One sequence counter, assigned under the append lock
//! - CRC32C checksum per frame
//! - Timer-batched physical flushes
//! - Grouping of records by root operation for recovery
//!
//! Frame format:
//! ```text
//! +----------+------+---------+--------+
//! | Sequence | Tag  | Payload | CRC32C |
//! | 4B       | 2B   | var     | 4B     |
//! +----------+------+---------+--------+
//! ```
//!
//! Payloads are self-delimiting: strings are a 4-byte byte length followed
//! by UTF-16LE, integers are little-endian.

mod reader;
mod record;
mod verifier;
mod writer;

pub use reader::JournalReader;
pub use record::{FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE, JournalRecord, RecordKind};
pub use verifier::{IncompleteGroup, JournalVerifier};
pub use writer::JournalWriter;
