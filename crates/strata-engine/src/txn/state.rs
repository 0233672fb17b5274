use crate::catalog::TableHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_common::{Error, HlcTimestamp, Result, RowLocator};
use strata_storage::IndexKey;
use tokio::sync::{Mutex, MutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::warn;

/// Transaction lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Locks held on a table a transaction writes to
pub(crate) struct TableWriteLocks {
    pub(crate) table: Arc<TableHandle>,
    _rows: OwnedRwLockWriteGuard<()>,
    /// Row index first, then indexes in column order
    _trees: Vec<OwnedRwLockWriteGuard<()>>,
}

impl TableWriteLocks {
    pub(crate) fn new(
        table: Arc<TableHandle>,
        rows: OwnedRwLockWriteGuard<()>,
        trees: Vec<OwnedRwLockWriteGuard<()>>,
    ) -> Self {
        Self {
            table,
            _rows: rows,
            _trees: trees,
        }
    }
}

/// Shared rows lock held on a table a transaction reads from
pub(crate) struct TableReadLock {
    pub(crate) table: Arc<TableHandle>,
    _rows: OwnedRwLockReadGuard<()>,
}

impl TableReadLock {
    pub(crate) fn new(table: Arc<TableHandle>, rows: OwnedRwLockReadGuard<()>) -> Self {
        Self { table, _rows: rows }
    }
}

/// Pending index entry, applied at commit
#[derive(Clone, Debug, PartialEq)]
pub struct IndexDelta {
    pub table: String,
    pub column: String,
    pub key: IndexKey,
    pub locator: RowLocator,
}

/// Pending row index entry, applied at commit
#[derive(Clone, Debug, PartialEq)]
pub struct RowDelta {
    pub table: String,
    pub locator: RowLocator,
}

/// Everything a transaction buffers until commit
pub struct TransactionState {
    id: HlcTimestamp,
    pub(crate) status: TxnStatus,
    /// Raw page writes, applied as one batch
    pub(crate) page_ops: Vec<(u64, Vec<u8>)>,
    pub(crate) read_locks: HashMap<String, TableReadLock>,
    pub(crate) write_locks: HashMap<String, TableWriteLocks>,
    pub(crate) row_deltas: Vec<RowDelta>,
    pub(crate) unique_deltas: Vec<IndexDelta>,
    pub(crate) multi_deltas: Vec<IndexDelta>,
}

impl TransactionState {
    pub(crate) fn new(id: HlcTimestamp) -> Self {
        Self {
            id,
            status: TxnStatus::Active,
            page_ops: Vec::new(),
            read_locks: HashMap::new(),
            write_locks: HashMap::new(),
            row_deltas: Vec::new(),
            unique_deltas: Vec::new(),
            multi_deltas: Vec::new(),
        }
    }

    pub fn id(&self) -> HlcTimestamp {
        self.id
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            status => Err(Error::TransactionClosed(format!(
                "transaction {} is {status}",
                self.id
            ))),
        }
    }

    pub fn holds_write(&self, table: &str) -> bool {
        self.write_locks.contains_key(table)
    }

    pub fn holds_read(&self, table: &str) -> bool {
        self.read_locks.contains_key(table)
    }

    /// Whether some locked table sorts after `table`
    pub(crate) fn holds_after(&self, table: &str) -> bool {
        self.write_locks
            .keys()
            .chain(self.read_locks.keys())
            .any(|held| held.as_str() > table)
    }

    /// Buffered page write for `offset`, newest first
    pub(crate) fn pending_page(&self, offset: u64) -> Option<&[u8]> {
        self.page_ops
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, data)| data.as_slice())
    }

    pub(crate) fn pending_unique(&self, table: &str, column: &str, key: &IndexKey) -> Option<RowLocator> {
        self.unique_deltas
            .iter()
            .find(|d| d.table == table && d.column == column && d.key == *key)
            .map(|d| d.locator)
    }

    pub(crate) fn pending_multi<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
        key: &'a IndexKey,
    ) -> impl Iterator<Item = RowLocator> + 'a {
        self.multi_deltas
            .iter()
            .filter(move |d| d.table == table && d.column == column && d.key == *key)
            .map(|d| d.locator)
    }

    /// Buffered operations not yet committed
    pub fn pending_ops(&self) -> usize {
        self.page_ops.len() + self.row_deltas.len() + self.unique_deltas.len() + self.multi_deltas.len()
    }

    /// Drop every delta and lock, ending the transaction with `status`
    pub(crate) fn close(&mut self, status: TxnStatus) {
        self.status = status;
        self.page_ops.clear();
        self.row_deltas.clear();
        self.unique_deltas.clear();
        self.multi_deltas.clear();
        self.write_locks.clear();
        self.read_locks.clear();
    }
}

/// Handle to a running transaction
///
/// All operations on one transaction are serialized by its own lock.
pub struct Transaction {
    id: HlcTimestamp,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new(id: HlcTimestamp) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::new(id)),
        }
    }

    pub fn id(&self) -> HlcTimestamp {
        self.id
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> TxnStatus {
        self.state.lock().await.status
    }

    pub async fn pending_ops(&self) -> usize {
        self.state.lock().await.pending_ops()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status == TxnStatus::Active {
            warn!(
                txn = %self.id,
                pending = state.pending_ops(),
                "Transaction dropped while active, discarding its writes"
            );
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish_non_exhaustive()
    }
}
