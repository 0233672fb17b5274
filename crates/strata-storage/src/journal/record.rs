//! Journal records and their frame codec

use crate::codec::{Decoder, Encoder};
use crate::value::Value;
use strata_common::{Error, Result, RowLocator};

/// Sequence (4B) + tag (2B)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Trailing CRC32C
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Record type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum RecordKind {
    Insert = 1,
    InsertSlots = 2,
    WritePage = 3,
    UpdateUniqueIndex = 4,
    UpdateUniqueIndexCheckpoint = 5,
    UpdateTableIndex = 6,
    UpdateTableIndexCheckpoint = 7,
    UpdateMultiIndex = 8,
    UpdateMultiIndexCheckpoint = 9,
    InsertCheckpoint = 10,
    InsertAbort = 11,
}

impl RecordKind {
    pub fn from_tag(tag: i16) -> Result<Self> {
        Ok(match tag {
            1 => Self::Insert,
            2 => Self::InsertSlots,
            3 => Self::WritePage,
            4 => Self::UpdateUniqueIndex,
            5 => Self::UpdateUniqueIndexCheckpoint,
            6 => Self::UpdateTableIndex,
            7 => Self::UpdateTableIndexCheckpoint,
            8 => Self::UpdateMultiIndex,
            9 => Self::UpdateMultiIndexCheckpoint,
            10 => Self::InsertCheckpoint,
            11 => Self::InsertAbort,
            other => return Err(Error::UnknownRecordType(other)),
        })
    }

    pub fn tag(self) -> i16 {
        self as i16
    }
}

/// A journal record
///
/// Every record carries its own `sequence`, assigned by the writer. Records
/// that belong to an operation carry the sequence of their parent in
/// `related`; following the links leads to the operation's `Insert`.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalRecord {
    Insert {
        sequence: u32,
        table: String,
        values: Vec<(String, Value)>,
    },
    InsertSlots {
        sequence: u32,
        related: u32,
        locator: RowLocator,
    },
    WritePage {
        sequence: u32,
        related: u32,
        offset: u64,
        data: Vec<u8>,
    },
    UpdateUniqueIndex {
        sequence: u32,
        related: u32,
        column: String,
    },
    UpdateUniqueIndexCheckpoint {
        sequence: u32,
        related: u32,
        column: String,
    },
    UpdateTableIndex {
        sequence: u32,
        related: u32,
    },
    UpdateTableIndexCheckpoint {
        sequence: u32,
        related: u32,
    },
    UpdateMultiIndex {
        sequence: u32,
        related: u32,
        column: String,
    },
    UpdateMultiIndexCheckpoint {
        sequence: u32,
        related: u32,
        column: String,
    },
    InsertCheckpoint {
        sequence: u32,
        related: u32,
    },
    InsertAbort {
        sequence: u32,
        related: u32,
    },
}

impl JournalRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Insert { .. } => RecordKind::Insert,
            Self::InsertSlots { .. } => RecordKind::InsertSlots,
            Self::WritePage { .. } => RecordKind::WritePage,
            Self::UpdateUniqueIndex { .. } => RecordKind::UpdateUniqueIndex,
            Self::UpdateUniqueIndexCheckpoint { .. } => RecordKind::UpdateUniqueIndexCheckpoint,
            Self::UpdateTableIndex { .. } => RecordKind::UpdateTableIndex,
            Self::UpdateTableIndexCheckpoint { .. } => RecordKind::UpdateTableIndexCheckpoint,
            Self::UpdateMultiIndex { .. } => RecordKind::UpdateMultiIndex,
            Self::UpdateMultiIndexCheckpoint { .. } => RecordKind::UpdateMultiIndexCheckpoint,
            Self::InsertCheckpoint { .. } => RecordKind::InsertCheckpoint,
            Self::InsertAbort { .. } => RecordKind::InsertAbort,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Self::Insert { sequence, .. }
            | Self::InsertSlots { sequence, .. }
            | Self::WritePage { sequence, .. }
            | Self::UpdateUniqueIndex { sequence, .. }
            | Self::UpdateUniqueIndexCheckpoint { sequence, .. }
            | Self::UpdateTableIndex { sequence, .. }
            | Self::UpdateTableIndexCheckpoint { sequence, .. }
            | Self::UpdateMultiIndex { sequence, .. }
            | Self::UpdateMultiIndexCheckpoint { sequence, .. }
            | Self::InsertCheckpoint { sequence, .. }
            | Self::InsertAbort { sequence, .. } => *sequence,
        }
    }

    pub(crate) fn set_sequence(&mut self, seq: u32) {
        match self {
            Self::Insert { sequence, .. }
            | Self::InsertSlots { sequence, .. }
            | Self::WritePage { sequence, .. }
            | Self::UpdateUniqueIndex { sequence, .. }
            | Self::UpdateUniqueIndexCheckpoint { sequence, .. }
            | Self::UpdateTableIndex { sequence, .. }
            | Self::UpdateTableIndexCheckpoint { sequence, .. }
            | Self::UpdateMultiIndex { sequence, .. }
            | Self::UpdateMultiIndexCheckpoint { sequence, .. }
            | Self::InsertCheckpoint { sequence, .. }
            | Self::InsertAbort { sequence, .. } => *sequence = seq,
        }
    }

    /// Parent record, `None` for records that start an operation
    pub fn related(&self) -> Option<u32> {
        match self {
            Self::Insert { .. } => None,
            Self::InsertSlots { related, .. }
            | Self::WritePage { related, .. }
            | Self::UpdateUniqueIndex { related, .. }
            | Self::UpdateUniqueIndexCheckpoint { related, .. }
            | Self::UpdateTableIndex { related, .. }
            | Self::UpdateTableIndexCheckpoint { related, .. }
            | Self::UpdateMultiIndex { related, .. }
            | Self::UpdateMultiIndexCheckpoint { related, .. }
            | Self::InsertCheckpoint { related, .. }
            | Self::InsertAbort { related, .. } => Some(*related),
        }
    }

    /// True for records that close an operation group
    pub fn closes_group(&self) -> bool {
        matches!(self, Self::InsertCheckpoint { .. } | Self::InsertAbort { .. })
    }

    /// Serialize to a frame
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(64);
        enc.put_u32(self.sequence());
        enc.put_i16(self.kind().tag());
        match self {
            Self::Insert { table, values, .. } => {
                enc.put_str(table);
                enc.put_u16(values.len() as u16);
                for (column, value) in values {
                    enc.put_str(column);
                    value.encode(&mut enc);
                }
            }
            Self::InsertSlots {
                related, locator, ..
            } => {
                enc.put_u32(*related);
                enc.put_locator(locator);
            }
            Self::WritePage {
                related,
                offset,
                data,
                ..
            } => {
                enc.put_u32(*related);
                enc.put_u64(*offset);
                enc.put_bytes(data);
            }
            Self::UpdateUniqueIndex {
                related, column, ..
            }
            | Self::UpdateUniqueIndexCheckpoint {
                related, column, ..
            }
            | Self::UpdateMultiIndex {
                related, column, ..
            }
            | Self::UpdateMultiIndexCheckpoint {
                related, column, ..
            } => {
                enc.put_u32(*related);
                enc.put_str(column);
            }
            Self::UpdateTableIndex { related, .. }
            | Self::UpdateTableIndexCheckpoint { related, .. }
            | Self::InsertCheckpoint { related, .. }
            | Self::InsertAbort { related, .. } => {
                enc.put_u32(*related);
            }
        }
        let crc = crc32c::crc32c(enc.as_slice());
        enc.put_u32(crc);
        enc.finish()
    }

    /// Parse one frame from the front of `data`
    ///
    /// Returns `Ok(None)` when `data` ends before the frame does (a torn
    /// tail), an error for checksum mismatches and unknown tags.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        match Self::decode_frame(data) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(Error::UnexpectedEof { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Confirm that the incomplete frame at `pos` really ends the journal
    ///
    /// A checksum-valid frame starting anywhere after `pos` means the frame
    /// was damaged in place rather than cut short, reported as
    /// [`Error::JournalTruncated`].
    pub fn ensure_torn_tail(data: &[u8], pos: usize) -> Result<()> {
        if (pos + 1..data.len()).any(|at| Self::decode_frame(&data[at..]).is_ok()) {
            return Err(Error::JournalTruncated {
                position: pos as u64,
            });
        }
        Ok(())
    }

    fn decode_frame(data: &[u8]) -> Result<(Self, usize)> {
        let mut dec = Decoder::new(data);
        let sequence = dec.get_u32()?;
        let kind = RecordKind::from_tag(dec.get_i16()?)?;

        let record = match kind {
            RecordKind::Insert => {
                let table = dec.get_str()?;
                let n = dec.get_u16()? as usize;
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    let column = dec.get_str()?;
                    values.push((column, Value::decode(&mut dec)?));
                }
                Self::Insert {
                    sequence,
                    table,
                    values,
                }
            }
            RecordKind::InsertSlots => Self::InsertSlots {
                sequence,
                related: dec.get_u32()?,
                locator: dec.get_locator()?,
            },
            RecordKind::WritePage => Self::WritePage {
                sequence,
                related: dec.get_u32()?,
                offset: dec.get_u64()?,
                data: dec.get_bytes()?,
            },
            RecordKind::UpdateUniqueIndex => Self::UpdateUniqueIndex {
                sequence,
                related: dec.get_u32()?,
                column: dec.get_str()?,
            },
            RecordKind::UpdateUniqueIndexCheckpoint => Self::UpdateUniqueIndexCheckpoint {
                sequence,
                related: dec.get_u32()?,
                column: dec.get_str()?,
            },
            RecordKind::UpdateTableIndex => Self::UpdateTableIndex {
                sequence,
                related: dec.get_u32()?,
            },
            RecordKind::UpdateTableIndexCheckpoint => Self::UpdateTableIndexCheckpoint {
                sequence,
                related: dec.get_u32()?,
            },
            RecordKind::UpdateMultiIndex => Self::UpdateMultiIndex {
                sequence,
                related: dec.get_u32()?,
                column: dec.get_str()?,
            },
            RecordKind::UpdateMultiIndexCheckpoint => Self::UpdateMultiIndexCheckpoint {
                sequence,
                related: dec.get_u32()?,
                column: dec.get_str()?,
            },
            RecordKind::InsertCheckpoint => Self::InsertCheckpoint {
                sequence,
                related: dec.get_u32()?,
            },
            RecordKind::InsertAbort => Self::InsertAbort {
                sequence,
                related: dec.get_u32()?,
            },
        };

        let body_len = dec.position();
        let stored = dec.get_u32()?;
        let computed = crc32c::crc32c(&data[..body_len]);
        if stored != computed {
            return Err(Error::JournalCorrupt {
                sequence,
                reason: format!("crc mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            });
        }
        Ok((record, body_len + FRAME_TRAILER_SIZE))
    }

    // Constructors; the writer assigns the sequence on append

    pub fn insert(table: impl Into<String>, values: Vec<(String, Value)>) -> Self {
        Self::Insert {
            sequence: 0,
            table: table.into(),
            values,
        }
    }

    pub fn insert_slots(related: u32, locator: RowLocator) -> Self {
        Self::InsertSlots {
            sequence: 0,
            related,
            locator,
        }
    }

    pub fn write_page(related: u32, offset: u64, data: Vec<u8>) -> Self {
        Self::WritePage {
            sequence: 0,
            related,
            offset,
            data,
        }
    }

    pub fn update_unique_index(related: u32, column: impl Into<String>) -> Self {
        Self::UpdateUniqueIndex {
            sequence: 0,
            related,
            column: column.into(),
        }
    }

    pub fn update_unique_index_checkpoint(related: u32, column: impl Into<String>) -> Self {
        Self::UpdateUniqueIndexCheckpoint {
            sequence: 0,
            related,
            column: column.into(),
        }
    }

    pub fn update_table_index(related: u32) -> Self {
        Self::UpdateTableIndex {
            sequence: 0,
            related,
        }
    }

    pub fn update_table_index_checkpoint(related: u32) -> Self {
        Self::UpdateTableIndexCheckpoint {
            sequence: 0,
            related,
        }
    }

    pub fn update_multi_index(related: u32, column: impl Into<String>) -> Self {
        Self::UpdateMultiIndex {
            sequence: 0,
            related,
            column: column.into(),
        }
    }

    pub fn update_multi_index_checkpoint(related: u32, column: impl Into<String>) -> Self {
        Self::UpdateMultiIndexCheckpoint {
            sequence: 0,
            related,
            column: column.into(),
        }
    }

    pub fn insert_checkpoint(related: u32) -> Self {
        Self::InsertCheckpoint {
            sequence: 0,
            related,
        }
    }

    pub fn insert_abort(related: u32) -> Self {
        Self::InsertAbort {
            sequence: 0,
            related,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::ObjectId;

    fn with_seq(mut record: JournalRecord, seq: u32) -> JournalRecord {
        record.set_sequence(seq);
        record
    }

    fn every_kind() -> Vec<JournalRecord> {
        vec![
            with_seq(
                JournalRecord::insert(
                    "users",
                    vec![
                        ("id".into(), Value::Int(7)),
                        ("email".into(), Value::Text("a@b.c".into())),
                        ("owner".into(), Value::Id(ObjectId::new())),
                        ("score".into(), Value::Float(2.5)),
                        ("active".into(), Value::Bool(true)),
                        ("note".into(), Value::Null),
                    ],
                ),
                1,
            ),
            with_seq(JournalRecord::insert_slots(1, RowLocator::from_slots(3, 4)), 2),
            with_seq(JournalRecord::write_page(1, 4, vec![1, 2, 3]), 3),
            with_seq(JournalRecord::update_unique_index(1, "email"), 4),
            with_seq(JournalRecord::update_unique_index_checkpoint(4, "email"), 5),
            with_seq(JournalRecord::update_table_index(1), 6),
            with_seq(JournalRecord::update_table_index_checkpoint(6), 7),
            with_seq(JournalRecord::update_multi_index(1, "tag"), 8),
            with_seq(JournalRecord::update_multi_index_checkpoint(8, "tag"), 9),
            with_seq(JournalRecord::insert_checkpoint(1), 10),
            with_seq(JournalRecord::insert_abort(1), 11),
        ]
    }

    #[test]
    fn test_every_kind_roundtrips() {
        for record in every_kind() {
            let frame = record.encode();
            let (decoded, used) = JournalRecord::decode(&frame).unwrap().unwrap();
            assert_eq!(decoded, record);
            assert_eq!(used, frame.len());
        }
    }

    #[test]
    fn test_checkpoint_frame_layout() {
        let frame = with_seq(JournalRecord::insert_checkpoint(0x0102_0304), 9).encode();
        assert_eq!(frame.len(), 6 + 4 + 4);
        assert_eq!(&frame[0..4], &9u32.to_le_bytes());
        assert_eq!(&frame[4..6], &10i16.to_le_bytes());
        assert_eq!(&frame[6..10], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&frame[10..14], &crc32c::crc32c(&frame[..10]).to_le_bytes());
    }

    #[test]
    fn test_truncated_frame_is_not_an_error() {
        let frame = every_kind()[0].encode();
        for cut in 0..frame.len() {
            assert!(JournalRecord::decode(&frame[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_crc_mismatch_and_unknown_tag() {
        let mut frame = every_kind()[3].encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            JournalRecord::decode(&frame),
            Err(Error::JournalCorrupt { sequence: 4, .. })
        ));

        let mut frame = every_kind()[9].encode();
        frame[4..6].copy_from_slice(&99i16.to_le_bytes());
        assert!(matches!(
            JournalRecord::decode(&frame),
            Err(Error::UnknownRecordType(99))
        ));
    }
}
