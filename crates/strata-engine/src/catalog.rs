//! Schema catalog
//!
//! Tables, their columns and the B-trees behind each index. The catalog is
//! persisted as one versioned binary blob in a page chain whose first page
//! is recorded in the pool header.
//!
//! Catalog blob (version 1):
//! ```text
//! +---------+--------+-----------------------------------------------+
//! | Version | Tables | per table: name, row index anchor,             |
//! | 2B      | 4B     |   columns (u16), per column: name, kind,       |
//! |         |        |   not_null, index anchor (0 when unindexed)    |
//! +---------+--------+-----------------------------------------------+
//! ```

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use strata_common::{BTreeConfig, Error, Result, RowLocator};
use strata_storage::codec::{Decoder, Encoder};
use strata_storage::{BTree, BufferPool, LocatorList};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tracing::info;

const CATALOG_VERSION: u16 = 1;

/// How a column is indexed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    None,
    Unique,
    Multi,
}

impl IndexKind {
    fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Unique => 1,
            Self::Multi => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Unique),
            2 => Ok(Self::Multi),
            other => Err(Error::deserialization(format!("unknown index kind {other}"))),
        }
    }
}

/// One column of a table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub index: IndexKind,
    pub not_null: bool,
}

/// Table definition handed to [`Catalog::create_table`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Add a nullable column
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, index: IndexKind) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            index,
            not_null: false,
        });
        self
    }

    /// Add a column that must carry a value
    #[must_use]
    pub fn required_column(mut self, name: impl Into<String>, index: IndexKind) -> Self {
        self.columns.push(ColumnSchema {
            name: name.into(),
            index,
            not_null: true,
        });
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("table name is empty".into()));
        }
        if self.columns.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "table '{}' has an unnamed column",
                    self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Tree backing one index
#[derive(Clone)]
pub enum IndexTree {
    Unique(Arc<BTree<RowLocator>>),
    Multi(Arc<BTree<LocatorList>>),
}

impl IndexTree {
    pub fn anchor(&self) -> u64 {
        match self {
            Self::Unique(tree) => tree.anchor(),
            Self::Multi(tree) => tree.anchor(),
        }
    }

    pub async fn writer_lock(&self) -> OwnedRwLockWriteGuard<()> {
        match self {
            Self::Unique(tree) => tree.writer_lock().await,
            Self::Multi(tree) => tree.writer_lock().await,
        }
    }

    pub async fn reader_lock(&self) -> OwnedRwLockReadGuard<()> {
        match self {
            Self::Unique(tree) => tree.reader_lock().await,
            Self::Multi(tree) => tree.reader_lock().await,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Unique(tree) => tree.len(),
            Self::Multi(tree) => tree.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An indexed column and its tree
#[derive(Clone)]
pub struct TableIndexSchema {
    pub column: String,
    pub kind: IndexKind,
    pub tree: IndexTree,
}

/// Live table: schema, row index, column indexes and the rows lock
pub struct TableHandle {
    schema: TableSchema,
    /// row id -> locator
    row_index: Arc<BTree<RowLocator>>,
    /// Indexed columns, in column order
    indexes: Vec<TableIndexSchema>,
    rows_lock: Arc<AsyncRwLock<()>>,
}

impl TableHandle {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn row_index(&self) -> &Arc<BTree<RowLocator>> {
        &self.row_index
    }

    pub fn indexes(&self) -> &[TableIndexSchema] {
        &self.indexes
    }

    pub fn index(&self, column: &str) -> Option<&TableIndexSchema> {
        self.indexes.iter().find(|i| i.column == column)
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = (&str, &Arc<BTree<RowLocator>>)> {
        self.indexes.iter().filter_map(|i| match &i.tree {
            IndexTree::Unique(tree) => Some((i.column.as_str(), tree)),
            IndexTree::Multi(_) => None,
        })
    }

    pub fn multi_indexes(&self) -> impl Iterator<Item = (&str, &Arc<BTree<LocatorList>>)> {
        self.indexes.iter().filter_map(|i| match &i.tree {
            IndexTree::Multi(tree) => Some((i.column.as_str(), tree)),
            IndexTree::Unique(_) => None,
        })
    }

    pub fn unique_tree(&self, column: &str) -> Option<&Arc<BTree<RowLocator>>> {
        match self.index(column).map(|i| &i.tree) {
            Some(IndexTree::Unique(tree)) => Some(tree),
            _ => None,
        }
    }

    pub fn multi_tree(&self, column: &str) -> Option<&Arc<BTree<LocatorList>>> {
        match self.index(column).map(|i| &i.tree) {
            Some(IndexTree::Multi(tree)) => Some(tree),
            _ => None,
        }
    }

    /// Shared hold on the table's rows, taken by the insert pipeline
    pub async fn rows_read(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.rows_lock).read_owned().await
    }

    /// Exclusive hold on the table's rows, taken by writing transactions
    pub async fn rows_write(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.rows_lock).write_owned().await
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(&self.schema.name);
        enc.put_u64(self.row_index.anchor());
        enc.put_u16(self.schema.columns.len() as u16);
        for column in &self.schema.columns {
            enc.put_str(&column.name);
            enc.put_u8(column.index.tag());
            enc.put_bool(column.not_null);
            enc.put_u64(self.index(&column.name).map_or(0, |i| i.tree.anchor()));
        }
    }

    fn decode(dec: &mut Decoder<'_>, pool: &Arc<BufferPool>) -> Result<Self> {
        let name = dec.get_str()?;
        let row_index = Arc::new(BTree::open(Arc::clone(pool), dec.get_u64()?)?);
        let column_count = dec.get_u16()?;

        let mut schema = TableSchema::new(name);
        let mut indexes = Vec::new();
        for _ in 0..column_count {
            let column = ColumnSchema {
                name: dec.get_str()?,
                index: IndexKind::from_tag(dec.get_u8()?)?,
                not_null: dec.get_bool()?,
            };
            let anchor = dec.get_u64()?;
            let tree = match column.index {
                IndexKind::None => None,
                IndexKind::Unique => Some(IndexTree::Unique(Arc::new(BTree::open(
                    Arc::clone(pool),
                    anchor,
                )?))),
                IndexKind::Multi => Some(IndexTree::Multi(Arc::new(BTree::open(
                    Arc::clone(pool),
                    anchor,
                )?))),
            };
            if let Some(tree) = tree {
                indexes.push(TableIndexSchema {
                    column: column.name.clone(),
                    kind: column.index,
                    tree,
                });
            }
            schema.columns.push(column);
        }

        Ok(Self {
            schema,
            row_index,
            indexes,
            rows_lock: Arc::new(AsyncRwLock::new(())),
        })
    }
}

/// Registry of tables, persisted through the buffer pool
pub struct Catalog {
    pool: Arc<BufferPool>,
    btree: BTreeConfig,
    tables: RwLock<BTreeMap<String, Arc<TableHandle>>>,
}

impl Catalog {
    /// Load the catalog recorded in the pool header, or start empty
    pub fn open(pool: Arc<BufferPool>, btree: BTreeConfig) -> Result<Self> {
        let offset = pool.catalog_offset();
        let mut tables = BTreeMap::new();

        if offset != 0 {
            let data = pool.read_data(offset)?;
            let mut dec = Decoder::new(&data);
            let version = dec.get_u16()?;
            if version != CATALOG_VERSION {
                return Err(Error::deserialization(format!(
                    "unsupported catalog version {version}"
                )));
            }
            let count = dec.get_u32()?;
            for _ in 0..count {
                let table = TableHandle::decode(&mut dec, &pool)?;
                tables.insert(table.name().to_string(), Arc::new(table));
            }
            dec.expect_end()?;
        }

        info!(tables = tables.len(), catalog_offset = offset, "Catalog loaded");

        Ok(Self {
            pool,
            btree,
            tables: RwLock::new(tables),
        })
    }

    /// Create a table with its row index and one tree per indexed column
    ///
    /// The catalog and the new trees are flushed before returning.
    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableHandle>> {
        schema.validate()?;
        let mut tables = self.tables.write();
        if tables.contains_key(&schema.name) {
            return Err(Error::TableAlreadyExists(schema.name));
        }

        let row_index = Arc::new(BTree::create(Arc::clone(&self.pool), &self.btree)?);
        let mut indexes = Vec::new();
        for column in &schema.columns {
            let tree = match column.index {
                IndexKind::None => continue,
                IndexKind::Unique => IndexTree::Unique(Arc::new(BTree::create(
                    Arc::clone(&self.pool),
                    &self.btree,
                )?)),
                IndexKind::Multi => IndexTree::Multi(Arc::new(BTree::create(
                    Arc::clone(&self.pool),
                    &self.btree,
                )?)),
            };
            indexes.push(TableIndexSchema {
                column: column.name.clone(),
                kind: column.index,
                tree,
            });
        }

        let handle = Arc::new(TableHandle {
            schema,
            row_index,
            indexes,
            rows_lock: Arc::new(AsyncRwLock::new(())),
        });
        tables.insert(handle.name().to_string(), Arc::clone(&handle));
        self.persist(&tables)?;

        info!(
            table = handle.name(),
            columns = handle.schema.columns.len(),
            indexes = handle.indexes.len(),
            "Created table"
        );
        Ok(handle)
    }

    fn persist(&self, tables: &BTreeMap<String, Arc<TableHandle>>) -> Result<()> {
        let mut enc = Encoder::new();
        enc.put_u16(CATALOG_VERSION);
        enc.put_u32(tables.len() as u32);
        for table in tables.values() {
            table.encode(&mut enc);
        }

        let mut offset = self.pool.catalog_offset();
        if offset == 0 {
            offset = self.pool.next_free_offset();
            self.pool.set_catalog_offset(offset);
        }
        self.pool.write_data_to_page(offset, enc.as_slice(), 0)?;
        self.pool.flush()?;
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableHandle>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::BufferPoolConfig;
    use strata_storage::{IndexKey, MemoryPageStore, Value};

    fn pool() -> Arc<BufferPool> {
        Arc::new(
            BufferPool::open(Arc::new(MemoryPageStore::new()), BufferPoolConfig::default())
                .unwrap(),
        )
    }

    fn users() -> TableSchema {
        TableSchema::new("users")
            .required_column("email", IndexKind::Unique)
            .column("city", IndexKind::Multi)
            .column("bio", IndexKind::None)
    }

    #[test]
    fn test_create_and_lookup() {
        let catalog = Catalog::open(pool(), BTreeConfig::default()).unwrap();
        let table = catalog.create_table(users()).unwrap();

        assert_eq!(table.indexes().len(), 2);
        assert_eq!(table.unique_indexes().count(), 1);
        assert_eq!(table.multi_indexes().count(), 1);
        assert!(table.index("bio").is_none());
        assert_eq!(table.index("email").unwrap().kind, IndexKind::Unique);

        assert!(catalog.table("users").is_ok());
        assert!(matches!(catalog.table("nope"), Err(Error::TableNotFound(_))));
        assert!(matches!(
            catalog.create_table(users()),
            Err(Error::TableAlreadyExists(_))
        ));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let catalog = Catalog::open(pool(), BTreeConfig::default()).unwrap();
        assert!(catalog.create_table(TableSchema::new("empty")).is_err());
        let dup = TableSchema::new("dup")
            .column("a", IndexKind::None)
            .column("a", IndexKind::Unique);
        assert!(matches!(
            catalog.create_table(dup),
            Err(Error::InvalidArgument(_))
        ));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_catalog_survives_reopen() {
        let store = Arc::new(MemoryPageStore::new());
        let key = IndexKey::single(Value::Text("a@x".into()));
        let loc = RowLocator::from_slots(7, 9);
        {
            let pool = Arc::new(
                BufferPool::open(store.clone(), BufferPoolConfig::default()).unwrap(),
            );
            let catalog = Catalog::open(Arc::clone(&pool), BTreeConfig::default()).unwrap();
            let table = catalog.create_table(users()).unwrap();
            catalog
                .create_table(TableSchema::new("events").column("kind", IndexKind::Multi))
                .unwrap();
            match &table.index("email").unwrap().tree {
                IndexTree::Unique(tree) => tree.put(key.clone(), loc).unwrap(),
                IndexTree::Multi(_) => panic!("wrong tree kind"),
            }
            pool.flush().unwrap();
        }

        let pool = Arc::new(BufferPool::open(store, BufferPoolConfig::default()).unwrap());
        let catalog = Catalog::open(pool, BTreeConfig::default()).unwrap();
        assert_eq!(catalog.table_names(), vec!["events".to_string(), "users".to_string()]);

        let table = catalog.table("users").unwrap();
        assert_eq!(table.schema(), &users());
        let (column, tree) = table.unique_indexes().next().unwrap();
        assert_eq!(column, "email");
        assert_eq!(tree.get(&key).unwrap(), Some(loc));
    }
}
