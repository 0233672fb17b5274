//! Page format
//!
//! Every page is exactly [`PAGE_SIZE`] bytes:
//!
//! ```text
//! +---------+----------+----------+-----------+----------+-------------+---------+
//! | Version | CRC32C   | Last seq | Next page | Reserved | Payload len | Payload |
//! | 2B      | 4B       | 4B       | 4B        | 8B       | 4B          | var     |
//! +---------+----------+----------+-----------+----------+-------------+---------+
//! ```
//!
//! All integers are little-endian. The checksum covers bytes
//! `6..26 + payload_len`. A page with version 0 was never written and is not
//! verified. Offsets are page numbers; page 0 is the pool header.

use strata_common::{Error, ObjectId, Result};

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Header size in bytes
pub const PAGE_HEADER_SIZE: usize = 26;

/// Payload bytes available per page
pub const PAGE_PAYLOAD_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Current page format version
pub const PAGE_FORMAT_VERSION: u16 = 1;

const VERSION_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 2;
const LAST_SEQ_OFFSET: usize = 6;
const NEXT_PAGE_OFFSET: usize = 10;
const PAYLOAD_LEN_OFFSET: usize = 22;

/// Store key for a page number
#[must_use]
pub fn page_key(offset: u64) -> ObjectId {
    ObjectId::from_slot(offset)
}

/// A single page frame
#[derive(Clone)]
pub struct Page {
    buf: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// A zeroed, never-written page
    #[must_use]
    pub fn empty() -> Self {
        Self {
            buf: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Load a page image read from a store, verifying its checksum
    pub fn from_bytes(offset: u64, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::storage(format!(
                "page {offset} has {} bytes, expected {PAGE_SIZE}",
                bytes.len()
            )));
        }
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(bytes);
        let page = Self { buf };

        if page.version() == 0 {
            return Ok(page);
        }
        if page.payload_len() > PAGE_PAYLOAD_CAPACITY {
            return Err(Error::storage(format!(
                "page {offset} payload length {} exceeds capacity",
                page.payload_len()
            )));
        }
        let expected = page.stored_checksum();
        let actual = page.compute_checksum();
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }
        Ok(page)
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Format version, 0 for never-written pages
    #[must_use]
    pub fn version(&self) -> u16 {
        self.read_u16(VERSION_OFFSET)
    }

    /// True if the page has never been written
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.version() == 0
    }

    /// Checksum stored in the header
    #[must_use]
    pub fn stored_checksum(&self) -> u32 {
        self.read_u32(CHECKSUM_OFFSET)
    }

    /// Journal sequence of the last write to this page
    #[must_use]
    pub fn last_seq(&self) -> u32 {
        self.read_u32(LAST_SEQ_OFFSET)
    }

    /// Next page in the overflow chain, 0 for none
    #[must_use]
    pub fn next_page(&self) -> u32 {
        self.read_u32(NEXT_PAGE_OFFSET)
    }

    /// Payload length in bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.read_u32(PAYLOAD_LEN_OFFSET) as usize
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let len = self.payload_len().min(PAGE_PAYLOAD_CAPACITY);
        &self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]
    }

    /// Replace the payload and stamp the header
    pub fn set_payload(&mut self, payload: &[u8], seq: u32) -> Result<()> {
        if payload.len() > PAGE_PAYLOAD_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not fit in one page",
                payload.len()
            )));
        }
        self.buf[PAGE_HEADER_SIZE..].fill(0);
        self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        self.buf[VERSION_OFFSET..VERSION_OFFSET + 2]
            .copy_from_slice(&PAGE_FORMAT_VERSION.to_le_bytes());
        self.write_u32(LAST_SEQ_OFFSET, seq);
        self.write_u32(PAYLOAD_LEN_OFFSET, payload.len() as u32);
        self.seal();
        Ok(())
    }

    /// Point the overflow chain at another page
    pub fn set_next_page(&mut self, next: u32) {
        self.write_u32(NEXT_PAGE_OFFSET, next);
        if !self.is_blank() {
            self.seal();
        }
    }

    fn compute_checksum(&self) -> u32 {
        let end = PAGE_HEADER_SIZE + self.payload_len().min(PAGE_PAYLOAD_CAPACITY);
        crc32c::crc32c(&self.buf[LAST_SEQ_OFFSET..end])
    }

    fn seal(&mut self) {
        let crc = self.compute_checksum();
        self.write_u32(CHECKSUM_OFFSET, crc);
    }

    /// Raw page image
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("version", &self.version())
            .field("last_seq", &self.last_seq())
            .field("next_page", &self.next_page())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}
