//! Page-backed B-tree index
//!
//! Ordered map from [`IndexKey`](crate::value::IndexKey) to a row locator
//! (unique and row indexes) or a sorted list of locators (multi indexes).
//!
//! # Layout
//!
//! ```text
//!   anchor page ──► root node ──► ... ──► leaf nodes
//!   (root, height,   internal: key → child page
//!    count, order)   leaf:     key → value
//! ```
//!
//! Each node is one page chain written through the buffer pool. Internal
//! entries carry the smallest key of their subtree; the last child catches
//! everything above the previous boundary. A node splits when it reaches
//! `order` entries, moving its upper half into a new sibling. A root split
//! grows the tree by one level.
//!
//! # Locking
//!
//! Structural mutation is serialized by an internal lock held only for the
//! duration of one `get` or `put`. The async [`BTree::writer_lock`] /
//! [`BTree::reader_lock`] pair is the logical lock callers hold across
//! multi-step operations.

mod node;
mod tree;

pub use tree::{BTree, TreeCheck};

use crate::codec::{Decoder, Encoder};
use strata_common::{Result, RowLocator};

/// Value stored in leaf entries
pub trait NodeValue: Clone + Send + Sync + 'static {
    fn encode(&self, enc: &mut Encoder);

    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;

    /// Combine the value already stored under a key with a new one
    fn merge(existing: &mut Self, incoming: Self);
}

impl NodeValue for RowLocator {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_locator(self);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.get_locator()
    }

    fn merge(existing: &mut Self, incoming: Self) {
        *existing = incoming;
    }
}

/// Sorted, duplicate-free locators sharing one key
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocatorList(Vec<RowLocator>);

impl LocatorList {
    #[must_use]
    pub fn single(locator: RowLocator) -> Self {
        Self(vec![locator])
    }

    /// Insert in sorted position; false if already present
    pub fn insert(&mut self, locator: RowLocator) -> bool {
        match self.0.binary_search(&locator) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, locator);
                true
            }
        }
    }

    /// Remove a locator; false if absent
    pub fn remove(&mut self, locator: &RowLocator) -> bool {
        match self.0.binary_search(locator) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn contains(&self, locator: &RowLocator) -> bool {
        self.0.binary_search(locator).is_ok()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[RowLocator] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<RowLocator> for LocatorList {
    fn from_iter<I: IntoIterator<Item = RowLocator>>(iter: I) -> Self {
        let mut list = Self::default();
        for locator in iter {
            list.insert(locator);
        }
        list
    }
}

impl NodeValue for LocatorList {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.0.len() as u32);
        for locator in &self.0 {
            enc.put_locator(locator);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let n = dec.get_u32()? as usize;
        let mut out = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            out.push(dec.get_locator()?);
        }
        Ok(Self(out))
    }

    fn merge(existing: &mut Self, incoming: Self) {
        for locator in incoming.0 {
            existing.insert(locator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_list_sorted_dedup() {
        let mut list = LocatorList::single(RowLocator::from_slots(5, 1));
        assert!(list.insert(RowLocator::from_slots(2, 1)));
        assert!(list.insert(RowLocator::from_slots(9, 1)));
        assert!(!list.insert(RowLocator::from_slots(5, 1)));
        let rows: Vec<u64> = list
            .as_slice()
            .iter()
            .map(|l| l.row_id.slot().unwrap())
            .collect();
        assert_eq!(rows, vec![2, 5, 9]);

        LocatorList::merge(
            &mut list,
            [RowLocator::from_slots(1, 1), RowLocator::from_slots(9, 1)]
                .into_iter()
                .collect(),
        );
        assert_eq!(list.len(), 4);
        assert!(list.remove(&RowLocator::from_slots(1, 1)));
        assert!(!list.contains(&RowLocator::from_slots(1, 1)));
    }
}
