use super::NodeValue;
use super::node::{Node, child_index};
use crate::buffer::BufferPool;
use crate::codec::{Decoder, Encoder};
use crate::value::IndexKey;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use strata_common::{BTreeConfig, Error, Result};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tracing::debug;

/// Anchor page magic ("BTRE")
const ANCHOR_MAGIC: u32 = 0x4552_5442;

#[derive(Clone, Copy, Debug)]
struct TreeMeta {
    root: u64,
    height: u32,
    len: u64,
}

/// Result of a structural check
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeCheck {
    pub nodes: usize,
    pub leaves: usize,
    pub entries: u64,
    pub max_node_entries: usize,
    pub min_node_entries: usize,
}

/// Page-backed B-tree
pub struct BTree<V: NodeValue> {
    pool: Arc<BufferPool>,
    anchor: u64,
    order: usize,
    meta: RwLock<TreeMeta>,
    logical: OnceLock<Arc<AsyncRwLock<()>>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: NodeValue> BTree<V> {
    /// Create an empty tree, allocating its anchor and root pages
    pub fn create(pool: Arc<BufferPool>, config: &BTreeConfig) -> Result<Self> {
        if config.order < 3 {
            return Err(Error::Configuration(format!(
                "btree order must be at least 3, got {}",
                config.order
            )));
        }
        let anchor = pool.next_free_offset();
        let root = pool.next_free_offset();
        let meta = TreeMeta {
            root,
            height: 0,
            len: 0,
        };
        let tree = Self {
            pool,
            anchor,
            order: config.order,
            meta: RwLock::new(meta),
            logical: OnceLock::new(),
            _value: PhantomData,
        };
        tree.write_node(root, &Node::<V>::Leaf(Vec::new()), 0)?;
        tree.write_anchor(&meta, 0)?;
        debug!(anchor, root, order = config.order, "Created index tree");
        Ok(tree)
    }

    /// Open a tree from its anchor page
    pub fn open(pool: Arc<BufferPool>, anchor: u64) -> Result<Self> {
        let bytes = pool.read_data(anchor)?;
        let mut dec = Decoder::new(&bytes);
        let magic = dec
            .get_u32()
            .map_err(|_| Error::internal(format!("index anchor at page {anchor} is empty")))?;
        if magic != ANCHOR_MAGIC {
            return Err(Error::internal(format!(
                "page {anchor} is not an index anchor (magic {magic:#010x})"
            )));
        }
        let meta = TreeMeta {
            root: dec.get_u64()?,
            height: dec.get_u32()?,
            len: dec.get_u64()?,
        };
        let order = dec.get_u32()? as usize;
        Ok(Self {
            pool,
            anchor,
            order,
            meta: RwLock::new(meta),
            logical: OnceLock::new(),
            _value: PhantomData,
        })
    }

    fn write_anchor(&self, meta: &TreeMeta, seq: u32) -> Result<()> {
        let mut enc = Encoder::with_capacity(32);
        enc.put_u32(ANCHOR_MAGIC);
        enc.put_u64(meta.root);
        enc.put_u32(meta.height);
        enc.put_u64(meta.len);
        enc.put_u32(self.order as u32);
        self.pool.write_data_to_page(self.anchor, &enc.finish(), seq)
    }

    fn load(&self, offset: u64) -> Result<Node<V>> {
        let bytes = self.pool.read_data(offset)?;
        Node::decode(offset, &bytes)
    }

    fn write_node(&self, offset: u64, node: &Node<V>, seq: u32) -> Result<()> {
        self.pool.write_data_to_page(offset, &node.encode(), seq)
    }

    /// Point lookup; `None` for absent keys
    pub fn get(&self, key: &IndexKey) -> Result<Option<V>> {
        let meta = self.meta.read();
        let mut offset = meta.root;
        for _ in 0..=meta.height {
            match self.load(offset)? {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone()));
                }
                Node::Internal(entries) => {
                    if entries.is_empty() {
                        return Err(Error::internal(format!("empty internal node at {offset}")));
                    }
                    offset = entries[child_index(&entries, key)].1;
                }
            }
        }
        Err(Error::internal(format!(
            "index tree at anchor {} deeper than its height {}",
            self.anchor, meta.height
        )))
    }

    /// Insert, or merge into the value already stored under `key`
    pub fn put(&self, key: IndexKey, value: V) -> Result<()> {
        self.put_at(key, value, 0)
    }

    /// [`put`](Self::put), stamping written pages with a journal sequence
    pub fn put_at(&self, key: IndexKey, value: V, seq: u32) -> Result<()> {
        let mut meta = self.meta.write();
        let (inserted, split) = self.insert(meta.root, meta.height, key, value, seq)?;

        let mut next = *meta;
        if inserted {
            next.len += 1;
        }
        if let Some((split_key, sibling)) = split {
            let left_key = self
                .load(meta.root)?
                .first_key()
                .cloned()
                .unwrap_or_default();
            let new_root = self.pool.next_free_offset();
            let root = Node::<V>::Internal(vec![(left_key, meta.root), (split_key, sibling)]);
            self.write_node(new_root, &root, seq)?;
            next.root = new_root;
            next.height += 1;
            debug!(anchor = self.anchor, height = next.height, "Index root split");
        }
        if inserted || next.root != meta.root {
            self.write_anchor(&next, seq)?;
            *meta = next;
        }
        Ok(())
    }

    /// Returns whether a new key was added, and the sibling produced by a
    /// split of this node
    fn insert(
        &self,
        offset: u64,
        height: u32,
        key: IndexKey,
        value: V,
        seq: u32,
    ) -> Result<(bool, Option<(IndexKey, u64)>)> {
        let mut node = self.load(offset)?;
        let inserted = match &mut node {
            Node::Leaf(entries) => {
                if height != 0 {
                    return Err(Error::internal(format!(
                        "leaf at page {offset} above the leaf level"
                    )));
                }
                match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                    Ok(i) => {
                        V::merge(&mut entries[i].1, value);
                        false
                    }
                    Err(i) => {
                        entries.insert(i, (key, value));
                        true
                    }
                }
            }
            Node::Internal(entries) => {
                if height == 0 || entries.is_empty() {
                    return Err(Error::internal(format!(
                        "malformed internal node at page {offset}"
                    )));
                }
                let j = child_index(entries, &key);
                let (inserted, split) = self.insert(entries[j].1, height - 1, key, value, seq)?;
                match split {
                    Some(sibling) => entries.insert(j + 1, sibling),
                    None => return Ok((inserted, None)),
                }
                inserted
            }
        };

        if node.len() < self.order {
            self.write_node(offset, &node, seq)?;
            return Ok((inserted, None));
        }

        let sibling = self.pool.next_free_offset();
        let (left, right, split_key) = match node {
            Node::Leaf(mut entries) => {
                let upper = entries.split_off(entries.len() / 2);
                let split_key = upper[0].0.clone();
                (Node::Leaf(entries), Node::Leaf(upper), split_key)
            }
            Node::Internal(mut entries) => {
                let upper = entries.split_off(entries.len() / 2);
                let split_key = upper[0].0.clone();
                (Node::Internal(entries), Node::Internal(upper), split_key)
            }
        };
        self.write_node(sibling, &right, seq)?;
        self.write_node(offset, &left, seq)?;
        Ok((inserted, Some((split_key, sibling))))
    }

    /// Edit the value under `key` in place, dropping the entry when `keep`
    /// returns false. Returns whether `key` was present.
    ///
    /// Leaves are not merged after a removal, so a leaf may end up empty.
    pub fn retain(&self, key: &IndexKey, keep: impl FnOnce(&mut V) -> bool) -> Result<bool> {
        let mut meta = self.meta.write();
        let mut offset = meta.root;
        for _ in 0..meta.height {
            match self.load(offset)? {
                Node::Internal(entries) if !entries.is_empty() => {
                    offset = entries[child_index(&entries, key)].1;
                }
                _ => {
                    return Err(Error::internal(format!(
                        "malformed internal node at page {offset}"
                    )));
                }
            }
        }
        let Node::Leaf(mut entries) = self.load(offset)? else {
            return Err(Error::internal(format!("expected a leaf at page {offset}")));
        };
        let Ok(i) = entries.binary_search_by(|(k, _)| k.cmp(key)) else {
            return Ok(false);
        };

        if keep(&mut entries[i].1) {
            self.write_node(offset, &Node::Leaf(entries), 0)?;
            return Ok(true);
        }
        entries.remove(i);
        self.write_node(offset, &Node::Leaf(entries), 0)?;
        let next = TreeMeta {
            len: meta.len.saturating_sub(1),
            ..*meta
        };
        self.write_anchor(&next, 0)?;
        *meta = next;
        Ok(true)
    }

    fn logical_lock(&self) -> Arc<AsyncRwLock<()>> {
        Arc::clone(self.logical.get_or_init(|| Arc::new(AsyncRwLock::new(()))))
    }

    /// Exclusive logical lock, released when the guard drops
    pub async fn writer_lock(&self) -> OwnedRwLockWriteGuard<()> {
        self.logical_lock().write_owned().await
    }

    /// Shared logical lock, released when the guard drops
    pub async fn reader_lock(&self) -> OwnedRwLockReadGuard<()> {
        self.logical_lock().read_owned().await
    }

    /// Number of distinct keys
    pub fn len(&self) -> u64 {
        self.meta.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Levels above the leaves
    pub fn height(&self) -> u32 {
        self.meta.read().height
    }

    /// Page holding the tree's root pointer
    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// All entries in key order
    pub fn iter_keys(&self) -> Result<Vec<(IndexKey, V)>> {
        let meta = self.meta.read();
        let mut out = Vec::new();
        self.collect(meta.root, meta.height, &mut out)?;
        Ok(out)
    }

    fn collect(&self, offset: u64, height: u32, out: &mut Vec<(IndexKey, V)>) -> Result<()> {
        match self.load(offset)? {
            Node::Leaf(entries) => out.extend(entries),
            Node::Internal(entries) => {
                for (_, child) in entries {
                    self.collect(child, height.saturating_sub(1), out)?;
                }
            }
        }
        Ok(())
    }

    /// Verify ordering, uniform leaf depth and node occupancy
    pub fn check(&self) -> Result<TreeCheck> {
        let meta = self.meta.read();
        let mut report = TreeCheck {
            min_node_entries: usize::MAX,
            ..TreeCheck::default()
        };
        let mut last: Option<IndexKey> = None;
        self.check_node(meta.root, meta.height, true, &mut last, &mut report)?;
        if report.entries != meta.len {
            return Err(Error::internal(format!(
                "index at anchor {} holds {} entries but records {}",
                self.anchor, report.entries, meta.len
            )));
        }
        Ok(report)
    }

    fn check_node(
        &self,
        offset: u64,
        height: u32,
        is_root: bool,
        last: &mut Option<IndexKey>,
        report: &mut TreeCheck,
    ) -> Result<()> {
        let node = self.load(offset)?;
        let n = node.len();
        if n >= self.order || (n == 0 && !(is_root && height == 0)) {
            return Err(Error::internal(format!(
                "node at page {offset} holds {n} entries, order {}",
                self.order
            )));
        }
        report.nodes += 1;
        report.max_node_entries = report.max_node_entries.max(n);
        report.min_node_entries = report.min_node_entries.min(n);

        match node {
            Node::Leaf(entries) => {
                if height != 0 {
                    return Err(Error::internal(format!(
                        "leaf at page {offset} found {height} levels above the leaf level"
                    )));
                }
                report.leaves += 1;
                for (key, _) in entries {
                    if last.as_ref().is_some_and(|prev| prev >= &key) {
                        return Err(Error::internal(format!(
                            "keys out of order at page {offset}"
                        )));
                    }
                    *last = Some(key);
                    report.entries += 1;
                }
            }
            Node::Internal(entries) => {
                if height == 0 {
                    return Err(Error::internal(format!(
                        "internal node at page {offset} on the leaf level"
                    )));
                }
                for (_, child) in entries {
                    self.check_node(child, height - 1, false, last, report)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::LocatorList;
    use crate::store::MemoryPageStore;
    use crate::value::Value;
    use rand::seq::SliceRandom;
    use std::time::Duration;
    use strata_common::{BufferPoolConfig, RowLocator};

    fn pool() -> Arc<BufferPool> {
        Arc::new(
            BufferPool::open(Arc::new(MemoryPageStore::new()), BufferPoolConfig::default())
                .unwrap(),
        )
    }

    fn key(v: i64) -> IndexKey {
        IndexKey::single(Value::Int(v))
    }

    fn small(order: usize) -> BTreeConfig {
        BTreeConfig { order }
    }

    #[test]
    fn test_empty_tree() {
        let tree = BTree::<RowLocator>::create(pool(), &small(4)).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.get(&key(1)).unwrap(), None);
        tree.check().unwrap();
    }

    #[test]
    fn test_random_order_inserts_survive_splits() {
        let tree = BTree::<RowLocator>::create(pool(), &small(4)).unwrap();
        let mut keys: Vec<i64> = (0..500).collect();
        keys.shuffle(&mut rand::thread_rng());

        for k in &keys {
            tree.put(key(*k), RowLocator::from_slots(*k as u64 + 1, 1)).unwrap();
        }
        // overwrite a few with new values
        for k in keys.iter().take(50) {
            tree.put(key(*k), RowLocator::from_slots(*k as u64 + 1, 2)).unwrap();
        }

        assert_eq!(tree.len(), 500);
        assert!(tree.height() >= 3);
        for (i, k) in keys.iter().enumerate() {
            let expected_page = if i < 50 { 2 } else { 1 };
            assert_eq!(
                tree.get(&key(*k)).unwrap(),
                Some(RowLocator::from_slots(*k as u64 + 1, expected_page))
            );
        }
        assert_eq!(tree.get(&key(-1)).unwrap(), None);
        assert_eq!(tree.get(&key(500)).unwrap(), None);

        let report = tree.check().unwrap();
        assert_eq!(report.entries, 500);
        assert!(report.max_node_entries <= 3);
        assert!(report.min_node_entries >= 1);

        let in_order: Vec<IndexKey> = tree.iter_keys().unwrap().into_iter().map(|e| e.0).collect();
        let expected: Vec<IndexKey> = (0..500).map(key).collect();
        assert_eq!(in_order, expected);
    }

    #[test]
    fn test_split_at_order() {
        let tree = BTree::<RowLocator>::create(pool(), &small(4)).unwrap();
        for k in 0..3 {
            tree.put(key(k), RowLocator::from_slots(1, 1)).unwrap();
        }
        assert_eq!(tree.height(), 0);
        tree.put(key(3), RowLocator::from_slots(1, 1)).unwrap();
        assert_eq!(tree.height(), 1);
        let report = tree.check().unwrap();
        assert_eq!(report.leaves, 2);
        assert_eq!(report.nodes, 3);
    }

    #[test]
    fn test_descending_inserts_and_smaller_than_first_key() {
        let tree = BTree::<RowLocator>::create(pool(), &small(5)).unwrap();
        for k in (0..200).rev() {
            tree.put(key(k * 2), RowLocator::from_slots(k as u64 + 1, 1)).unwrap();
        }
        tree.put(key(-7), RowLocator::from_slots(999, 1)).unwrap();
        assert_eq!(tree.get(&key(-7)).unwrap(), Some(RowLocator::from_slots(999, 1)));
        assert_eq!(tree.get(&key(3)).unwrap(), None);
        tree.check().unwrap();
    }

    #[test]
    fn test_text_keys_with_overflowing_nodes() {
        let tree = BTree::<RowLocator>::create(pool(), &small(16)).unwrap();
        for i in 0..300u64 {
            let text = format!("{i:05}-{}", "x".repeat(200));
            tree.put(
                IndexKey::single(Value::Text(text)),
                RowLocator::from_slots(i + 1, 1),
            )
            .unwrap();
        }
        let wide = IndexKey::single(Value::Text(format!("{:05}-{}", 123, "x".repeat(200))));
        assert_eq!(tree.get(&wide).unwrap(), Some(RowLocator::from_slots(124, 1)));
        tree.check().unwrap();
    }

    #[test]
    fn test_multi_values_merge() {
        let tree = BTree::<LocatorList>::create(pool(), &small(4)).unwrap();
        for row in [5u64, 1, 3, 1] {
            tree.put(key(42), LocatorList::single(RowLocator::from_slots(row, 9)))
                .unwrap();
        }
        let list = tree.get(&key(42)).unwrap().unwrap();
        let rows: Vec<u64> = list.as_slice().iter().map(|l| l.row_id.slot().unwrap()).collect();
        assert_eq!(rows, vec![1, 3, 5]);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_retain_edits_and_removes() {
        let tree = BTree::<LocatorList>::create(pool(), &small(4)).unwrap();
        for k in 0..40 {
            tree.put(key(k), LocatorList::single(RowLocator::from_slots(1, 9)))
                .unwrap();
        }
        tree.put(key(7), LocatorList::single(RowLocator::from_slots(2, 9)))
            .unwrap();

        // shrink a list but keep the key
        assert!(
            tree.retain(&key(7), |list| {
                list.remove(&RowLocator::from_slots(1, 9));
                !list.is_empty()
            })
            .unwrap()
        );
        let rows = tree.get(&key(7)).unwrap().unwrap();
        assert_eq!(rows.as_slice(), &[RowLocator::from_slots(2, 9)]);
        assert_eq!(tree.len(), 40);

        assert!(tree.retain(&key(12), |_| false).unwrap());
        assert_eq!(tree.get(&key(12)).unwrap(), None);
        assert_eq!(tree.len(), 39);
        assert!(!tree.retain(&key(12), |_| false).unwrap());
        assert!(!tree.retain(&key(99), |_| false).unwrap());

        let keys: Vec<IndexKey> = tree.iter_keys().unwrap().into_iter().map(|e| e.0).collect();
        let expected: Vec<IndexKey> = (0..40).filter(|k| *k != 12).map(key).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_reopen_from_anchor() {
        let pool = pool();
        let anchor = {
            let tree = BTree::<RowLocator>::create(Arc::clone(&pool), &small(4)).unwrap();
            for k in 0..64 {
                tree.put(key(k), RowLocator::from_slots(k as u64 + 1, 3)).unwrap();
            }
            tree.anchor()
        };
        pool.flush().unwrap();

        let tree = BTree::<RowLocator>::open(pool, anchor).unwrap();
        assert_eq!(tree.len(), 64);
        assert_eq!(tree.order(), 4);
        assert_eq!(tree.get(&key(17)).unwrap(), Some(RowLocator::from_slots(18, 3)));
        tree.check().unwrap();
    }

    #[tokio::test]
    async fn test_writer_lock_excludes_readers() {
        let tree = Arc::new(BTree::<RowLocator>::create(pool(), &small(4)).unwrap());
        let writer = tree.writer_lock().await;

        let reader_tree = Arc::clone(&tree);
        let reader = tokio::spawn(async move {
            let _guard = reader_tree.reader_lock().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        // structural access is not blocked by the logical lock
        tree.put(key(1), RowLocator::from_slots(1, 1)).unwrap();
        drop(writer);
        reader.await.unwrap();

        let _a = tree.reader_lock().await;
        let _b = tree.reader_lock().await;
    }
}
