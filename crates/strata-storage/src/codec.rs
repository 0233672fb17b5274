//! Binary encoding helpers shared by pages, index nodes, journal frames and
//! the catalog
//!
//! Integers are little-endian. Strings are a 4-byte byte length followed by
//! UTF-16LE code units.

use bytes::{Buf, BufMut, BytesMut};
use strata_common::{Error, OBJECT_ID_LEN, ObjectId, Result, RowLocator};

/// Append-only encoder
#[derive(Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Length-prefixed raw bytes
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Length-prefixed UTF-16LE string
    pub fn put_str(&mut self, v: &str) {
        let units: Vec<u16> = v.encode_utf16().collect();
        self.buf.put_u32_le((units.len() * 2) as u32);
        for unit in units {
            self.buf.put_u16_le(unit);
        }
    }

    pub fn put_object_id(&mut self, id: &ObjectId) {
        self.buf.put_slice(id.as_bytes());
    }

    pub fn put_locator(&mut self, loc: &RowLocator) {
        self.put_object_id(&loc.row_id);
        self.put_object_id(&loc.data_page);
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current contents, for checksumming before the trailer is appended
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over an encoded buffer
///
/// Every read checks the remaining length first; short input is
/// [`Error::UnexpectedEof`], never a panic.
pub struct Decoder<'a> {
    buf: &'a [u8],
    start_len: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            start_len: buf.len(),
            buf,
        }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::UnexpectedEof {
                position: self.position(),
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.start_len - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::deserialization(format!("invalid bool byte {other}"))),
        }
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        if len % 2 != 0 {
            return Err(Error::deserialization(format!(
                "UTF-16 string has odd byte length {len}"
            )));
        }
        self.need(len)?;
        let units: Vec<u16> = (0..len / 2).map(|_| self.buf.get_u16_le()).collect();
        String::from_utf16(&units)
            .map_err(|e| Error::deserialization(format!("invalid UTF-16 string: {e}")))
    }

    pub fn get_object_id(&mut self) -> Result<ObjectId> {
        self.need(OBJECT_ID_LEN)?;
        let mut raw = [0u8; OBJECT_ID_LEN];
        self.buf.copy_to_slice(&mut raw);
        Ok(ObjectId::from_bytes(raw))
    }

    pub fn get_locator(&mut self) -> Result<RowLocator> {
        let row_id = self.get_object_id()?;
        let data_page = self.get_object_id()?;
        Ok(RowLocator::new(row_id, data_page))
    }

    /// Fail unless the whole input was consumed
    pub fn expect_end(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::deserialization(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
