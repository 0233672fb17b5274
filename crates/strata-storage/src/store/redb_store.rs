use super::PageStore;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use strata_common::{Error, ObjectId, Result};

/// Key: 12-byte object id, Value: page image
const PAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pages");

fn redb_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::storage(format!("redb {context}: {e}"))
}

/// Page store backed by redb
///
/// Every write is its own committed write transaction; `batch_write` commits
/// all pages in one transaction.
pub struct RedbPageStore {
    db: Database,
}

impl RedbPageStore {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| redb_err("open", e))?;

        // Ensure the table exists so readers never see TableDoesNotExist
        let write_txn = db.begin_write().map_err(|e| redb_err("begin", e))?;
        {
            let _t = write_txn
                .open_table(PAGES)
                .map_err(|e| redb_err("open table", e))?;
        }
        write_txn.commit().map_err(|e| redb_err("commit", e))?;

        Ok(Self { db })
    }

    fn put_all<'a>(&self, ops: impl Iterator<Item = (&'a ObjectId, &'a [u8])>) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(|e| redb_err("begin", e))?;
        {
            let mut table = write_txn
                .open_table(PAGES)
                .map_err(|e| redb_err("open table", e))?;
            for (id, data) in ops {
                table
                    .insert(id.as_bytes().as_slice(), data)
                    .map_err(|e| redb_err("insert", e))?;
            }
        }
        write_txn.commit().map_err(|e| redb_err("commit", e))
    }
}

impl PageStore for RedbPageStore {
    fn read(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(|e| redb_err("begin", e))?;
        let table = read_txn
            .open_table(PAGES)
            .map_err(|e| redb_err("open table", e))?;
        let page = table
            .get(id.as_bytes().as_slice())
            .map_err(|e| redb_err("get", e))?;
        Ok(page.map(|guard| guard.value().to_vec()))
    }

    fn write(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.put_all(std::iter::once((id, data)))
    }

    fn batch_write(&self, ops: &[(ObjectId, Vec<u8>)]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.put_all(ops.iter().map(|(id, data)| (id, data.as_slice())))
    }

    fn delete(&self, id: &ObjectId) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(|e| redb_err("begin", e))?;
        {
            let mut table = write_txn
                .open_table(PAGES)
                .map_err(|e| redb_err("open table", e))?;
            table
                .remove(id.as_bytes().as_slice())
                .map_err(|e| redb_err("remove", e))?;
        }
        write_txn.commit().map_err(|e| redb_err("commit", e))
    }

    fn sync(&self) -> Result<()> {
        // Commits are durable on return
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redb"
    }
}
