use super::NodeValue;
use crate::codec::{Decoder, Encoder};
use crate::value::IndexKey;
use strata_common::{Error, Result};

const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;

/// Decoded node
///
/// Payload: kind (1B), entry count (2B), then entries. Leaf entries are
/// `key, value`; internal entries are `key, child page (8B)`.
#[derive(Clone, Debug)]
pub(super) enum Node<V> {
    Leaf(Vec<(IndexKey, V)>),
    Internal(Vec<(IndexKey, u64)>),
}

impl<V: NodeValue> Node<V> {
    pub(super) fn len(&self) -> usize {
        match self {
            Self::Leaf(entries) => entries.len(),
            Self::Internal(entries) => entries.len(),
        }
    }

    pub(super) fn first_key(&self) -> Option<&IndexKey> {
        match self {
            Self::Leaf(entries) => entries.first().map(|(k, _)| k),
            Self::Internal(entries) => entries.first().map(|(k, _)| k),
        }
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Self::Leaf(entries) => {
                enc.put_u8(KIND_LEAF);
                enc.put_u16(entries.len() as u16);
                for (key, value) in entries {
                    key.encode(&mut enc);
                    value.encode(&mut enc);
                }
            }
            Self::Internal(entries) => {
                enc.put_u8(KIND_INTERNAL);
                enc.put_u16(entries.len() as u16);
                for (key, child) in entries {
                    key.encode(&mut enc);
                    enc.put_u64(*child);
                }
            }
        }
        enc.finish()
    }

    pub(super) fn decode(offset: u64, bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let kind = dec
            .get_u8()
            .map_err(|_| Error::internal(format!("index node at page {offset} is empty")))?;
        let count = dec.get_u16()? as usize;
        let node = match kind {
            KIND_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = IndexKey::decode(&mut dec)?;
                    entries.push((key, V::decode(&mut dec)?));
                }
                Self::Leaf(entries)
            }
            KIND_INTERNAL => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = IndexKey::decode(&mut dec)?;
                    entries.push((key, dec.get_u64()?));
                }
                Self::Internal(entries)
            }
            other => {
                return Err(Error::internal(format!(
                    "unknown index node kind {other} at page {offset}"
                )));
            }
        };
        dec.expect_end()?;
        Ok(node)
    }
}

/// Child slot whose range holds `key`: the last entry whose key is not
/// greater than `key`, or the first entry
pub(super) fn child_index<T>(entries: &[(IndexKey, T)], key: &IndexKey) -> usize {
    entries
        .partition_point(|(k, _)| k <= key)
        .saturating_sub(1)
}
