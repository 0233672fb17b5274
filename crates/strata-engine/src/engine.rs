//! Engine facade
//!
//! Wires the page store, buffer pool, journal, catalog, insert pipeline and
//! transaction manager together. Opening an engine replays the journal
//! before any work is accepted.

use crate::catalog::{Catalog, IndexTree, TableHandle, TableSchema};
use crate::insert::{InsertPipeline, InsertRecoverer, InsertTicket, RecoveryReport, Row};
use crate::txn::{Transaction, TransactionManager};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use strata_common::{EngineConfig, Error, Result, RowLocator, StoreBackend};
use strata_storage::{
    BufferPool, IndexKey, JournalReader, JournalWriter, PoolStatsSnapshot, Value, open_store,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Index size, for stats output
#[derive(Clone, Debug, Serialize)]
pub struct IndexStats {
    pub column: String,
    pub kind: String,
    pub entries: u64,
}

/// Table size, for stats output
#[derive(Clone, Debug, Serialize)]
pub struct TableStats {
    pub name: String,
    pub rows: u64,
    pub indexes: Vec<IndexStats>,
}

/// Point-in-time engine statistics
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub backend: &'static str,
    pub pool: PoolStatsSnapshot,
    pub cached_pages: usize,
    pub dirty_pages: usize,
    pub journal_sequence: u32,
    pub journal_bytes: u64,
    pub active_transactions: usize,
    pub tables: Vec<TableStats>,
}

/// Embedded transactional storage engine
pub struct Engine {
    config: EngineConfig,
    pool: Arc<BufferPool>,
    journal: Arc<JournalWriter>,
    catalog: Arc<Catalog>,
    pipeline: InsertPipeline,
    txns: TransactionManager,
    recovery: RecoveryReport,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine, recover unfinished inserts, then start background tasks
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;

        let store = open_store(&config)?;
        let pool = Arc::new(BufferPool::open(store, config.buffer_pool.clone())?);
        let journal = Arc::new(JournalWriter::open(
            config.journal_path(),
            config.journal.clone(),
        )?);
        pool.attach_journal(Arc::clone(&journal));

        if config.storage.backend == StoreBackend::Memory && journal.size() > 0 {
            // pages did not survive, so the old journal describes nothing
            warn!(path = %journal.path().display(), "Discarding journal of an in-memory engine");
            journal.reset()?;
        }

        let catalog = Arc::new(Catalog::open(Arc::clone(&pool), config.btree.clone())?);
        let pipeline = InsertPipeline::new(Arc::clone(&journal), Arc::clone(&pool));

        let recovery = InsertRecoverer::new(&catalog, &pipeline)
            .recover(JournalReader::open(journal.path())?)
            .await?;
        journal.flush()?;
        pool.flush()?;
        // every group is closed and its pages are on disk
        journal.reset()?;

        let txns = TransactionManager::new(Arc::clone(&catalog), Arc::clone(&pool));
        let tasks = vec![pool.spawn_gc(), journal.spawn_flusher()];

        info!(
            dir = %config.storage.data_dir.display(),
            backend = pool.store().name(),
            tables = catalog.len(),
            recovered = recovery.incomplete,
            "Engine opened"
        );

        Ok(Self {
            config,
            pool,
            journal,
            catalog,
            pipeline,
            txns,
            recovery,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What the startup recovery did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableHandle>> {
        self.catalog.create_table(schema)
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableHandle>> {
        self.catalog.table(name)
    }

    /// Insert one row through the journaled pipeline
    pub async fn insert(&self, ticket: InsertTicket) -> Result<RowLocator> {
        let table = self.catalog.table(&ticket.table)?;
        self.pipeline.insert(table, ticket).await
    }

    /// Rows whose `column` equals `value`
    pub async fn lookup(&self, table: &str, column: &str, value: Value) -> Result<Vec<RowLocator>> {
        let table = self.catalog.table(table)?;
        let index = table.index(column).ok_or_else(|| Error::IndexNotFound {
            table: table.name().to_string(),
            column: column.to_string(),
        })?;
        let _guard = index.tree.reader_lock().await;
        let key = IndexKey::single(value);
        match &index.tree {
            IndexTree::Unique(tree) => Ok(tree.get(&key)?.into_iter().collect()),
            IndexTree::Multi(tree) => Ok(tree
                .get(&key)?
                .map(|list| list.as_slice().to_vec())
                .unwrap_or_default()),
        }
    }

    /// Read the row stored at `locator`
    pub fn read_row(&self, locator: RowLocator) -> Result<Row> {
        let page = locator
            .page_offset()
            .ok_or_else(|| Error::InvalidArgument(format!("{locator:?} has no page slot")))?;
        let data = self.pool.read_data(page)?;
        if data.is_empty() {
            return Err(Error::InvalidArgument(format!("no row stored at {locator:?}")));
        }
        Row::decode(&data)
    }

    /// Every row of a table, in row id order
    pub async fn scan(&self, table: &str) -> Result<Vec<Row>> {
        let table = self.catalog.table(table)?;
        let _guard = table.row_index().reader_lock().await;
        table
            .row_index()
            .iter_keys()?
            .into_iter()
            .map(|(_, locator)| self.read_row(locator))
            .collect()
    }

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        self.txns.start()
    }

    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        self.txns.commit(txn).await
    }

    pub async fn rollback(&self, txn: &Transaction) -> Result<()> {
        self.txns.rollback(txn).await
    }

    /// Make everything written so far durable
    pub fn flush(&self) -> Result<()> {
        self.journal.flush()?;
        self.pool.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let mut tables = Vec::new();
        for name in self.catalog.table_names() {
            let table = self.catalog.table(&name)?;
            let indexes = table
                .indexes()
                .iter()
                .map(|index| IndexStats {
                    column: index.column.clone(),
                    kind: format!("{:?}", index.kind).to_lowercase(),
                    entries: index.tree.len(),
                })
                .collect();
            tables.push(TableStats {
                name,
                rows: table.row_index().len(),
                indexes,
            });
        }

        Ok(EngineStats {
            backend: self.pool.store().name(),
            pool: self.pool.stats(),
            cached_pages: self.pool.cached_pages(),
            dirty_pages: self.pool.dirty_pages(),
            journal_sequence: self.journal.current_sequence(),
            journal_bytes: self.journal.size(),
            active_transactions: self.txns.active_count(),
            tables,
        })
    }

    /// Stop background tasks and flush
    pub fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let active = self.txns.active_count();
        if active > 0 {
            warn!(active, "Shutting down with open transactions; their writes are discarded");
        }
        self.flush()?;
        info!(dir = %self.config.storage.data_dir.display(), "Engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexKind;
    use strata_storage::JournalRecord;
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        TableSchema::new("users")
            .required_column("email", IndexKind::Unique)
            .column("city", IndexKind::Multi)
            .column("age", IndexKind::None)
    }

    fn user(email: &str, city: &str, age: i64) -> InsertTicket {
        InsertTicket::new("users")
            .with("email", email)
            .with("city", city)
            .with("age", age)
    }

    #[tokio::test]
    async fn test_insert_lookup_and_read() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::at(dir.path(), StoreBackend::Memory))
            .await
            .unwrap();
        engine.create_table(schema()).unwrap();

        let a = engine.insert(user("a@x", "oslo", 30)).await.unwrap();
        let b = engine.insert(user("b@x", "oslo", 41)).await.unwrap();

        assert_eq!(
            engine.lookup("users", "email", Value::from("a@x")).await.unwrap(),
            vec![a]
        );
        let mut both = vec![a, b];
        both.sort();
        assert_eq!(
            engine.lookup("users", "city", Value::from("oslo")).await.unwrap(),
            both
        );
        assert!(matches!(
            engine.lookup("users", "age", Value::Int(30)).await,
            Err(Error::IndexNotFound { .. })
        ));

        let row = engine.read_row(b).unwrap();
        assert_eq!(row.get("age"), Some(&Value::Int(41)));
        assert_eq!(engine.scan("users").await.unwrap().len(), 2);

        let stats = engine.stats().unwrap();
        assert_eq!(stats.tables[0].rows, 2);
        assert_eq!(stats.backend, "memory");
        engine.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        for backend in [StoreBackend::Mmap, StoreBackend::Redb] {
            let dir = tempdir().unwrap();
            let config = EngineConfig::at(dir.path(), backend);
            let loc = {
                let engine = Engine::open(config.clone()).await.unwrap();
                engine.create_table(schema()).unwrap();
                let loc = engine.insert(user("a@x", "rome", 7)).await.unwrap();
                engine.shutdown().unwrap();
                loc
            };

            let engine = Engine::open(config).await.unwrap();
            assert_eq!(engine.recovery_report().incomplete, 0);
            assert_eq!(
                engine.lookup("users", "email", Value::from("a@x")).await.unwrap(),
                vec![loc]
            );
            assert_eq!(engine.read_row(loc).unwrap().get("city"), Some(&Value::from("rome")));
            // a fresh insert does not reuse the old slots
            let next = engine.insert(user("b@x", "rome", 8)).await.unwrap();
            assert_ne!(next.row_id, loc.row_id);
            assert_ne!(next.data_page, loc.data_page);
            engine.shutdown().unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_finishes_interrupted_insert() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::at(dir.path(), StoreBackend::Mmap);
        {
            let engine = Engine::open(config.clone()).await.unwrap();
            engine.create_table(schema()).unwrap();
            engine.shutdown().unwrap();
        }

        // an insert that crashed right after its slots were journaled
        {
            let journal = JournalWriter::open(config.journal_path(), config.journal.clone()).unwrap();
            let ticket = user("late@x", "lima", 5);
            let root = journal
                .append(JournalRecord::insert("users", ticket.values))
                .unwrap();
            journal
                .append(JournalRecord::insert_slots(root, RowLocator::from_slots(900, 900)))
                .unwrap();
            journal.flush().unwrap();
        }

        let engine = Engine::open(config.clone()).await.unwrap();
        let report = engine.recovery_report();
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.completed(), 1);
        assert_eq!(report.resumed[0].step, "update_unique_keys");

        let loc = RowLocator::from_slots(900, 900);
        assert_eq!(
            engine.lookup("users", "email", Value::from("late@x")).await.unwrap(),
            vec![loc]
        );
        assert_eq!(engine.read_row(loc).unwrap().get("city"), Some(&Value::from("lima")));
        // the journal was emptied once recovery finished
        assert_eq!(engine.stats().unwrap().journal_bytes, 0);

        // counters moved past the recovered slots
        let next = engine.insert(user("next@x", "lima", 6)).await.unwrap();
        assert!(next.row_id > loc.row_id);
        engine.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_transactions_through_facade() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::at(dir.path(), StoreBackend::Memory))
            .await
            .unwrap();
        engine.create_table(schema()).unwrap();

        let txn = engine.begin_transaction();
        let loc = engine
            .transactions()
            .insert(&txn, user("t@x", "kyiv", 20))
            .await
            .unwrap();
        engine.commit(&txn).await.unwrap();
        assert_eq!(
            engine.lookup("users", "email", Value::from("t@x")).await.unwrap(),
            vec![loc]
        );
        assert_eq!(engine.read_row(loc).unwrap().locator, loc);

        // the pipeline sees the committed key
        assert!(matches!(
            engine.insert(user("t@x", "kyiv", 21)).await,
            Err(Error::DuplicateKey { .. })
        ));

        let txn = engine.begin_transaction();
        engine
            .transactions()
            .insert(&txn, user("gone@x", "kyiv", 22))
            .await
            .unwrap();
        engine.rollback(&txn).await.unwrap();
        assert!(
            engine
                .lookup("users", "email", Value::from("gone@x"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
