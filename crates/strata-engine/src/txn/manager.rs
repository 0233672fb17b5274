use super::state::{
    IndexDelta, RowDelta, TableReadLock, TableWriteLocks, Transaction, TransactionState, TxnStatus,
};
use crate::catalog::{Catalog, IndexTree, TableHandle};
use crate::insert::{InsertTicket, Row};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use strata_common::{Error, HlcClock, HlcTimestamp, Result, RowLocator};
use strata_storage::{BTree, BufferPool, IndexKey, LocatorList, Value};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

/// Index entry written by a commit in progress
enum Published<'a> {
    Entry(&'a Arc<BTree<RowLocator>>, IndexKey, RowLocator),
    Member(&'a Arc<BTree<LocatorList>>, IndexKey, RowLocator),
}

/// Starts, tracks and finishes transactions
///
/// Writes are buffered in the transaction and reach the shared indexes and
/// pages only at commit. A transaction writing to a table holds the table's
/// rows lock exclusively together with the writer lock of every tree of that
/// table until it ends; reading takes the rows lock shared. Tables are always
/// locked in name order.
///
/// Only weak handles are tracked: a transaction dropped without commit or
/// rollback releases its locks and stops counting as active.
pub struct TransactionManager {
    clock: HlcClock,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    active: DashMap<HlcTimestamp, Weak<Transaction>>,
}

impl TransactionManager {
    pub fn new(catalog: Arc<Catalog>, pool: Arc<BufferPool>) -> Self {
        Self::with_clock(catalog, pool, HlcClock::new())
    }

    pub fn with_clock(catalog: Arc<Catalog>, pool: Arc<BufferPool>, clock: HlcClock) -> Self {
        Self {
            clock,
            catalog,
            pool,
            active: DashMap::new(),
        }
    }

    /// Begin a transaction identified by a fresh HLC timestamp
    pub fn start(&self) -> Arc<Transaction> {
        self.prune();
        let id = self.clock.now();
        let txn = Arc::new(Transaction::new(id));
        self.active.insert(id, Arc::downgrade(&txn));
        debug!(txn = %id, "Transaction started");
        txn
    }

    pub fn active_count(&self) -> usize {
        self.prune();
        self.active.len()
    }

    fn prune(&self) {
        self.active.retain(|_, txn| txn.strong_count() > 0);
    }

    /// Take the write locks of `table`, once per transaction
    pub async fn try_acquire_write_locks(&self, txn: &Transaction, table: &Arc<TableHandle>) -> Result<()> {
        let mut state = txn.lock().await;
        state.ensure_active()?;
        Self::acquire(&mut state, table, LockMode::Write).await;
        Ok(())
    }

    /// Take the shared rows lock of `table`, once per transaction
    pub async fn try_acquire_table_rows_read_lock(
        &self,
        txn: &Transaction,
        table: &Arc<TableHandle>,
    ) -> Result<()> {
        let mut state = txn.lock().await;
        state.ensure_active()?;
        Self::acquire(&mut state, table, LockMode::Read).await;
        Ok(())
    }

    async fn acquire(state: &mut TransactionState, table: &Arc<TableHandle>, mode: LockMode) {
        let held = if state.holds_write(table.name()) {
            Some(LockMode::Write)
        } else if state.holds_read(table.name()) {
            Some(LockMode::Read)
        } else {
            None
        };
        if held == Some(LockMode::Write) || held == Some(mode) {
            return;
        }

        if !state.holds_after(table.name()) {
            Self::lock_table(state, table, mode).await;
            return;
        }

        // out of order: drop everything and take the whole set again by name
        let mut wanted: BTreeMap<String, (Arc<TableHandle>, LockMode)> = BTreeMap::new();
        for (name, locks) in state.write_locks.drain() {
            wanted.insert(name, (Arc::clone(&locks.table), LockMode::Write));
        }
        for (name, lock) in state.read_locks.drain() {
            wanted.insert(name, (Arc::clone(&lock.table), LockMode::Read));
        }
        wanted
            .entry(table.name().to_string())
            .and_modify(|(_, held)| {
                if mode == LockMode::Write {
                    *held = LockMode::Write;
                }
            })
            .or_insert_with(|| (Arc::clone(table), mode));
        debug!(txn = %state.id(), tables = wanted.len(), "Reacquiring table locks in name order");

        for (table, mode) in wanted.into_values() {
            Self::lock_table(state, &table, mode).await;
        }
    }

    async fn lock_table(state: &mut TransactionState, table: &Arc<TableHandle>, mode: LockMode) {
        match mode {
            LockMode::Read => {
                let rows = table.rows_read().await;
                state
                    .read_locks
                    .insert(table.name().to_string(), TableReadLock::new(Arc::clone(table), rows));
            }
            LockMode::Write => {
                // upgrade: give up the shared hold before queueing for the exclusive one
                if state.read_locks.remove(table.name()).is_some() {
                    debug!(txn = %state.id(), table = %table.name(), "Releasing read lock for upgrade");
                }
                let rows = table.rows_write().await;
                let mut trees = Vec::with_capacity(table.indexes().len() + 1);
                trees.push(table.row_index().writer_lock().await);
                for index in table.indexes() {
                    trees.push(index.tree.writer_lock().await);
                }
                state.write_locks.insert(
                    table.name().to_string(),
                    TableWriteLocks::new(Arc::clone(table), rows, trees),
                );
                debug!(txn = %state.id(), table = %table.name(), "Write locks acquired");
            }
        }
    }

    /// Buffer an insert; nothing is visible to others until commit
    pub async fn insert(&self, txn: &Transaction, ticket: InsertTicket) -> Result<RowLocator> {
        let table = self.catalog.table(&ticket.table)?;
        ticket.validate(table.schema())?;

        let mut state = txn.lock().await;
        state.ensure_active()?;
        Self::acquire(&mut state, &table, LockMode::Write).await;

        for (column, tree) in table.unique_indexes() {
            let Some(value) = ticket.present(column) else {
                continue;
            };
            let key = IndexKey::single(value.clone());
            if tree.get(&key)?.is_some() || state.pending_unique(table.name(), column, &key).is_some() {
                return Err(Error::DuplicateKey {
                    table: table.name().to_string(),
                    column: column.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let locator = RowLocator::from_slots(self.pool.next_row_id(), self.pool.next_free_offset());
        let page = locator
            .page_offset()
            .ok_or_else(|| Error::internal("row locator has no page slot"))?;
        state.page_ops.push((page, ticket.encode_row(locator)));
        state.row_deltas.push(RowDelta {
            table: table.name().to_string(),
            locator,
        });

        for index in table.indexes() {
            let Some(value) = ticket.present(&index.column) else {
                continue;
            };
            let delta = IndexDelta {
                table: table.name().to_string(),
                column: index.column.clone(),
                key: IndexKey::single(value.clone()),
                locator,
            };
            match index.tree {
                IndexTree::Unique(_) => state.unique_deltas.push(delta),
                IndexTree::Multi(_) => state.multi_deltas.push(delta),
            }
        }

        debug!(txn = %state.id(), table = %table.name(), locator = ?locator, "Buffered insert");
        Ok(locator)
    }

    /// Look up `key` on an indexed column, seeing this transaction's own writes
    pub async fn get(
        &self,
        txn: &Transaction,
        table: &str,
        column: &str,
        key: &IndexKey,
    ) -> Result<Vec<RowLocator>> {
        let table = self.catalog.table(table)?;
        let mut state = txn.lock().await;
        state.ensure_active()?;
        Self::acquire(&mut state, &table, LockMode::Read).await;

        let index = table.index(column).ok_or_else(|| Error::IndexNotFound {
            table: table.name().to_string(),
            column: column.to_string(),
        })?;
        match &index.tree {
            IndexTree::Unique(tree) => {
                if let Some(locator) = state.pending_unique(table.name(), column, key) {
                    return Ok(vec![locator]);
                }
                Ok(tree.get(key)?.into_iter().collect())
            }
            IndexTree::Multi(tree) => {
                let mut list: LocatorList = tree.get(key)?.unwrap_or_default();
                for locator in state.pending_multi(table.name(), column, key) {
                    list.insert(locator);
                }
                Ok(list.as_slice().to_vec())
            }
        }
    }

    /// Read a row, preferring this transaction's buffered copy
    pub async fn read_row(&self, txn: &Transaction, locator: RowLocator) -> Result<Row> {
        let page = locator
            .page_offset()
            .ok_or_else(|| Error::InvalidArgument(format!("{locator:?} has no page slot")))?;
        let state = txn.lock().await;
        state.ensure_active()?;
        match state.pending_page(page) {
            Some(data) => Row::decode(data),
            None => Row::decode(&self.pool.read_data(page)?),
        }
    }

    /// Apply every buffered delta, then the page batch, then release locks
    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        let mut state = txn.lock().await;
        state.ensure_active()?;

        if let Err(e) = self.check_unique_deltas(&state) {
            warn!(txn = %state.id(), error = %e, "Commit rejected, rolling back");
            state.close(TxnStatus::RolledBack);
            self.active.remove(&txn.id());
            return Err(e);
        }

        let result = self.apply(&state);
        let (status, outcome) = match result {
            Ok(()) => (TxnStatus::Committed, "committed"),
            Err(_) => (TxnStatus::RolledBack, "failed"),
        };
        let ops = state.pending_ops();
        state.close(status);
        self.active.remove(&txn.id());
        info!(txn = %txn.id(), ops, outcome, "Transaction finished");
        result
    }

    fn locks_for<'a>(state: &'a TransactionState, table: &str) -> Result<&'a TableWriteLocks> {
        state
            .write_locks
            .get(table)
            .ok_or_else(|| Error::internal(format!("delta for '{table}' without write locks")))
    }

    fn unique_tree<'a>(
        state: &'a TransactionState,
        delta: &IndexDelta,
    ) -> Result<&'a Arc<BTree<RowLocator>>> {
        Self::locks_for(state, &delta.table)?
            .table
            .unique_tree(&delta.column)
            .ok_or_else(|| Error::IndexNotFound {
                table: delta.table.clone(),
                column: delta.column.clone(),
            })
    }

    /// Unique keys may have been taken since they were buffered
    fn check_unique_deltas(&self, state: &TransactionState) -> Result<()> {
        for delta in &state.unique_deltas {
            let tree = Self::unique_tree(state, delta)?;
            if matches!(tree.get(&delta.key)?, Some(existing) if existing != delta.locator) {
                return Err(Error::DuplicateKey {
                    table: delta.table.clone(),
                    column: delta.column.clone(),
                    value: delta.key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn multi_tree<'a>(
        state: &'a TransactionState,
        delta: &IndexDelta,
    ) -> Result<&'a Arc<BTree<LocatorList>>> {
        Self::locks_for(state, &delta.table)?
            .table
            .multi_tree(&delta.column)
            .ok_or_else(|| Error::IndexNotFound {
                table: delta.table.clone(),
                column: delta.column.clone(),
            })
    }

    /// Rows reach storage before any index points at them; index entries
    /// written before a failure are taken back out.
    fn apply(&self, state: &TransactionState) -> Result<()> {
        if !state.page_ops.is_empty() {
            self.pool.apply_batch(&state.page_ops, 0)?;
            self.pool.flush()?;
        }

        let mut published = Vec::with_capacity(
            state.row_deltas.len() + state.unique_deltas.len() + state.multi_deltas.len(),
        );
        let result = Self::publish(state, &mut published).and_then(|()| self.pool.flush().map(|_| ()));
        if let Err(e) = &result {
            warn!(txn = %state.id(), entries = published.len(), error = %e, "Commit failed, withdrawing index entries");
            Self::withdraw(published);
            if let Err(e) = self.pool.flush() {
                warn!(txn = %state.id(), error = %e, "Flush after withdrawal failed");
            }
        }
        result
    }

    fn publish<'a>(state: &'a TransactionState, published: &mut Vec<Published<'a>>) -> Result<()> {
        for delta in &state.row_deltas {
            let tree = Self::locks_for(state, &delta.table)?.table.row_index();
            let key = IndexKey::single(Value::Id(delta.locator.row_id));
            published.push(Published::Entry(tree, key.clone(), delta.locator));
            tree.put(key, delta.locator)?;
        }
        for delta in &state.unique_deltas {
            let tree = Self::unique_tree(state, delta)?;
            published.push(Published::Entry(tree, delta.key.clone(), delta.locator));
            tree.put(delta.key.clone(), delta.locator)?;
        }
        for delta in &state.multi_deltas {
            let tree = Self::multi_tree(state, delta)?;
            published.push(Published::Member(tree, delta.key.clone(), delta.locator));
            tree.put(delta.key.clone(), LocatorList::single(delta.locator))?;
        }
        Ok(())
    }

    /// Newest first; an entry that never made it in is left alone
    fn withdraw(published: Vec<Published<'_>>) {
        for entry in published.into_iter().rev() {
            let result = match &entry {
                Published::Entry(tree, key, locator) => tree.retain(key, |existing| *existing != *locator),
                Published::Member(tree, key, locator) => tree.retain(key, |list| {
                    list.remove(locator);
                    !list.is_empty()
                }),
            };
            if let Err(e) = result {
                let key = match &entry {
                    Published::Entry(_, key, _) | Published::Member(_, key, _) => key,
                };
                error!(key = %key, error = %e, "Failed to withdraw index entry");
            }
        }
    }

    /// Discard every buffered write and release the locks
    pub async fn rollback(&self, txn: &Transaction) -> Result<()> {
        let mut state = txn.lock().await;
        state.ensure_active()?;
        let ops = state.pending_ops();
        state.close(TxnStatus::RolledBack);
        self.active.remove(&txn.id());
        info!(txn = %txn.id(), discarded = ops, "Transaction rolled back");
        Ok(())
    }
}
