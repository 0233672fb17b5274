use super::record::JournalRecord;
use std::path::Path;
use strata_common::{Error, Result};
use tracing::warn;

/// Sequential reader over a journal file
///
/// Yields records in file order and stops at end of file. A torn trailing
/// frame ends iteration with a warning and is reported by
/// [`truncated_at`](Self::truncated_at). A corrupt frame, an unknown record
/// type or a short frame with intact frames after it is yielded as an error,
/// after which the reader is exhausted.
pub struct JournalReader {
    data: Vec<u8>,
    pos: usize,
    done: bool,
    truncated_at: Option<u64>,
}

impl JournalReader {
    /// Read the journal at `path`; a missing file reads as empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to read journal '{}': {e}",
                    path.display()
                )));
            }
        };
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            done: false,
            truncated_at: None,
        }
    }

    /// Byte offset of a torn trailing frame, once iteration reached it
    pub fn truncated_at(&self) -> Option<u64> {
        self.truncated_at
    }

    /// Bytes consumed so far
    pub fn position(&self) -> u64 {
        self.pos as u64
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        match JournalRecord::decode(&self.data[self.pos..]) {
            Ok(Some((record, used))) => {
                self.pos += used;
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                if let Err(e) = JournalRecord::ensure_torn_tail(&self.data, self.pos) {
                    warn!(position = self.pos, "Journal frame damaged before intact data");
                    return Some(Err(e));
                }
                self.truncated_at = Some(self.pos as u64);
                warn!(
                    position = self.pos,
                    trailing = self.data.len() - self.pos,
                    "Journal ends with a truncated frame"
                );
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for JournalReader {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalRecord, JournalWriter};
    use crate::value::Value;
    use strata_common::JournalConfig;
    use tempfile::tempdir;

    fn frames(records: &[JournalRecord]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let mut record = record.clone();
            record.set_sequence(i as u32 + 1);
            out.extend(record.encode());
        }
        out
    }

    #[test]
    fn test_reads_in_order_and_stops_at_eof() {
        let data = frames(&[
            JournalRecord::insert("t", vec![("a".into(), Value::Int(1))]),
            JournalRecord::insert_slots(1, strata_common::RowLocator::from_slots(1, 1)),
            JournalRecord::insert_checkpoint(1),
        ]);
        let mut reader = JournalReader::from_bytes(data);
        let kinds: Vec<_> = reader.by_ref().map(|r| r.unwrap().sequence()).collect();
        assert_eq!(kinds, vec![1, 2, 3]);
        assert_eq!(reader.truncated_at(), None);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_truncated_tail_reported() {
        let mut data = frames(&[
            JournalRecord::insert("t", vec![]),
            JournalRecord::update_table_index(1),
        ]);
        let first_len = JournalRecord::decode(&data).unwrap().unwrap().1;
        data.truncate(data.len() - 2);

        let mut reader = JournalReader::from_bytes(data);
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
        assert_eq!(reader.truncated_at(), Some(first_len as u64));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut data = frames(&[
            JournalRecord::insert("t", vec![]),
            JournalRecord::insert_checkpoint(1),
        ]);
        let first_len = JournalRecord::decode(&data).unwrap().unwrap().1;
        data[first_len + 4..first_len + 6].copy_from_slice(&(-3i16).to_le_bytes());

        let mut reader = JournalReader::from_bytes(data);
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(
            reader.next(),
            Some(Err(Error::UnknownRecordType(-3)))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let mut reader = JournalReader::open(dir.path().join("nope.log")).unwrap();
        assert!(reader.next().is_none());

        let path = dir.path().join("journal.log");
        let writer = JournalWriter::open(&path, JournalConfig::default()).unwrap();
        writer.append(JournalRecord::insert("t", vec![])).unwrap();
        // not flushed yet
        assert_eq!(JournalReader::open(&path).unwrap().count(), 0);
        writer.flush().unwrap();
        assert_eq!(JournalReader::open(&path).unwrap().count(), 1);
    }

    #[test]
    fn test_damaged_frame_before_intact_data_is_fatal() {
        let mut data = frames(&[
            JournalRecord::insert("accounts", vec![("a".into(), Value::Int(1))]),
            JournalRecord::update_table_index(1),
            JournalRecord::insert_checkpoint(1),
        ]);
        // high byte of the table name length
        data[9] = 0x7f;

        let mut reader = JournalReader::from_bytes(data);
        assert!(matches!(
            reader.next(),
            Some(Err(Error::JournalTruncated { position: 0 }))
        ));
        assert!(reader.next().is_none());
        assert_eq!(reader.truncated_at(), None);
    }
}
