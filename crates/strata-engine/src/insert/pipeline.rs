use super::{InsertStep, InsertTicket};
use crate::catalog::TableHandle;
use crate::flux::{AbortCause, Flux, FluxOutcome, StepOutcome, aborted};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use strata_common::{Error, Result, RowLocator};
use strata_storage::{BufferPool, IndexKey, JournalRecord, JournalWriter, LocatorList, Value};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

/// State threaded through one insert
pub struct InsertState {
    table: Arc<TableHandle>,
    ticket: InsertTicket,
    /// Sequence of the `Insert` record that opened this group
    root: u32,
    locator: RowLocator,
    /// Unique columns whose checkpoint is already in the journal
    unique_done: HashSet<String>,
    /// Multi columns whose checkpoint is already in the journal
    multi_done: HashSet<String>,
    /// Writer locks on the unique trees, held from the check to the update
    unique_guards: Vec<OwnedRwLockWriteGuard<()>>,
    /// Reason for a requested abort
    failure: Option<Error>,
    journal: Arc<JournalWriter>,
    pool: Arc<BufferPool>,
}

impl InsertState {
    pub(super) fn new(
        table: Arc<TableHandle>,
        ticket: InsertTicket,
        root: u32,
        journal: Arc<JournalWriter>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            table,
            ticket,
            root,
            locator: RowLocator::UNSET,
            unique_done: HashSet::new(),
            multi_done: HashSet::new(),
            unique_guards: Vec::new(),
            failure: None,
            journal,
            pool,
        }
    }

    /// Restore a locator read back from the journal
    pub(super) fn with_locator(mut self, locator: RowLocator) -> Self {
        if let (Some(row_id), Some(page)) = (locator.row_id.slot(), locator.page_offset()) {
            self.pool.reserve_allocated(row_id, page);
        }
        self.locator = locator;
        self
    }

    pub(super) fn with_done(mut self, unique: HashSet<String>, multi: HashSet<String>) -> Self {
        self.unique_done = unique;
        self.multi_done = multi;
        self
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn locator(&self) -> RowLocator {
        self.locator
    }

    pub fn ticket(&self) -> &InsertTicket {
        &self.ticket
    }

    fn table_name(&self) -> String {
        self.table.name().to_string()
    }

    /// Journal, then pages; checkpoints may only follow this
    fn make_durable(&self) -> Result<()> {
        self.journal.flush()?;
        self.pool.flush()?;
        Ok(())
    }

    async fn lock_unique_trees(&mut self) {
        if !self.unique_guards.is_empty() {
            return;
        }
        let table = Arc::clone(&self.table);
        for (_, tree) in table.unique_indexes() {
            self.unique_guards.push(tree.writer_lock().await);
        }
    }

    fn allocate_slots(&mut self) -> Result<()> {
        if self.locator.is_allocated() {
            return Ok(());
        }
        let locator = RowLocator::from_slots(self.pool.next_row_id(), self.pool.next_free_offset());
        self.journal
            .append(JournalRecord::insert_slots(self.root, locator))?;
        self.locator = locator;
        debug!(root = self.root, locator = ?locator, "Allocated row slots");
        Ok(())
    }

    fn check_unique_keys(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            self.lock_unique_trees().await;
            let table = Arc::clone(&self.table);
            for (column, tree) in table.unique_indexes() {
                let Some(value) = self.ticket.present(column) else {
                    if table.schema().get_column(column).is_some_and(|c| c.not_null) {
                        self.failure = Some(Error::NullValue {
                            table: self.table_name(),
                            column: column.to_string(),
                        });
                        return Ok(StepOutcome::Abort);
                    }
                    continue;
                };
                match tree.get(&IndexKey::single(value.clone()))? {
                    Some(existing) if existing != self.locator => {
                        self.failure = Some(Error::DuplicateKey {
                            table: self.table_name(),
                            column: column.to_string(),
                            value: value.to_string(),
                        });
                        return Ok(StepOutcome::Abort);
                    }
                    _ => {}
                }
            }
            Ok(StepOutcome::Continue)
        })
    }

    fn update_unique_keys(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            self.lock_unique_trees().await;
            self.allocate_slots()?;

            let table = Arc::clone(&self.table);
            let mut written = Vec::new();
            for (column, tree) in table.unique_indexes() {
                if self.unique_done.contains(column) {
                    continue;
                }
                let Some(value) = self.ticket.present(column) else {
                    continue;
                };
                let seq = self
                    .journal
                    .append(JournalRecord::update_unique_index(self.root, column))?;
                tree.put_at(IndexKey::single(value.clone()), self.locator, seq)?;
                written.push((seq, column.to_string()));
            }

            if !written.is_empty() {
                self.make_durable()?;
                for (seq, column) in written {
                    self.journal
                        .append(JournalRecord::update_unique_index_checkpoint(seq, &column))?;
                    self.unique_done.insert(column);
                }
            }
            self.unique_guards.clear();
            Ok(StepOutcome::Continue)
        })
    }

    fn insert_to_page(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            self.allocate_slots()?;
            let page = self
                .locator
                .page_offset()
                .ok_or_else(|| Error::internal("row locator has no page slot"))?;
            let data = self.ticket.encode_row(self.locator);
            let seq = self
                .journal
                .append(JournalRecord::write_page(self.root, page, data.clone()))?;
            self.pool.write_data_to_page(page, &data, seq)?;
            Ok(StepOutcome::Continue)
        })
    }

    fn update_table_index(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let tree = Arc::clone(self.table.row_index());
            let _guard = tree.writer_lock().await;
            let seq = self
                .journal
                .append(JournalRecord::update_table_index(self.root))?;
            tree.put_at(
                IndexKey::single(Value::Id(self.locator.row_id)),
                self.locator,
                seq,
            )?;
            self.make_durable()?;
            self.journal
                .append(JournalRecord::update_table_index_checkpoint(seq))?;
            Ok(StepOutcome::Continue)
        })
    }

    fn update_multi_indexes(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let table = Arc::clone(&self.table);
            let mut written = Vec::new();
            for (column, tree) in table.multi_indexes() {
                if self.multi_done.contains(column) {
                    continue;
                }
                let Some(value) = self.ticket.present(column) else {
                    continue;
                };
                let _guard = tree.writer_lock().await;
                let seq = self
                    .journal
                    .append(JournalRecord::update_multi_index(self.root, column))?;
                tree.put_at(
                    IndexKey::single(value.clone()),
                    LocatorList::single(self.locator),
                    seq,
                )?;
                written.push((seq, column.to_string()));
            }

            if !written.is_empty() {
                self.make_durable()?;
                for (seq, column) in written {
                    self.journal
                        .append(JournalRecord::update_multi_index_checkpoint(seq, &column))?;
                    self.multi_done.insert(column);
                }
            }
            Ok(StepOutcome::Continue)
        })
    }

    fn checkpoint_insert(&mut self) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            self.journal
                .append(JournalRecord::insert_checkpoint(self.root))?;
            Ok(StepOutcome::Completed)
        })
    }

    fn on_abort(&mut self, cause: AbortCause) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.unique_guards.clear();
            match cause {
                AbortCause::Requested => {
                    warn!(
                        table = %self.table.name(),
                        root = self.root,
                        reason = ?self.failure,
                        "Insert aborted"
                    );
                    self.journal
                        .append(JournalRecord::insert_abort(self.root))?;
                    self.journal.flush()?;
                }
                // nothing durable yet, so the group can be closed
                AbortCause::Fault(reason) if !self.locator.is_allocated() => {
                    warn!(root = self.root, %reason, "Insert failed before allocation");
                    self.journal
                        .append(JournalRecord::insert_abort(self.root))?;
                }
                AbortCause::Fault(reason) => {
                    error!(
                        table = %self.table.name(),
                        root = self.root,
                        %reason,
                        "Insert failed, leaving it for recovery"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Runs inserts through the step machine
pub struct InsertPipeline {
    journal: Arc<JournalWriter>,
    pool: Arc<BufferPool>,
    /// Held shared by every insert in flight, exclusively by compaction
    groups: RwLock<()>,
}

impl InsertPipeline {
    pub fn new(journal: Arc<JournalWriter>, pool: Arc<BufferPool>) -> Self {
        Self {
            journal,
            pool,
            groups: RwLock::new(()),
        }
    }

    fn flux(start: InsertStep) -> Flux<InsertStep, InsertState> {
        let mut flux = Flux::starting_at(start);
        flux.when(InsertStep::CheckUniqueKeys, InsertState::check_unique_keys)
            .when(InsertStep::UpdateUniqueKeys, InsertState::update_unique_keys)
            .when(InsertStep::InsertToPage, InsertState::insert_to_page)
            .when(InsertStep::UpdateTableIndex, InsertState::update_table_index)
            .when(InsertStep::UpdateMultiIndexes, InsertState::update_multi_indexes)
            .when(InsertStep::CheckpointInsert, InsertState::checkpoint_insert)
            .when_abort(InsertState::on_abort);
        flux
    }

    /// Insert one row, returning where it was stored
    ///
    /// The ticket is validated before anything is journaled. A duplicate
    /// unique key aborts the insert with no row or index entry left behind.
    pub async fn insert(&self, table: Arc<TableHandle>, ticket: InsertTicket) -> Result<RowLocator> {
        ticket.validate(table.schema())?;
        let result = {
            let _group = self.groups.read().await;
            let _rows = table.rows_read().await;

            let root = self
                .journal
                .append(JournalRecord::insert(ticket.table.clone(), ticket.values.clone()))?;
            let state = InsertState::new(
                table,
                ticket,
                root,
                Arc::clone(&self.journal),
                Arc::clone(&self.pool),
            );
            self.drive(InsertStep::CheckUniqueKeys, state).await
        };
        if let Err(e) = self.compact_if_idle() {
            warn!(error = %e, "Journal compaction failed");
        }
        result
    }

    /// Truncate the journal once it has grown past its threshold and no
    /// insert is in flight
    ///
    /// Every group in the journal is closed at that point; pages reach the
    /// store before the log is cut. Returns whether the journal was cut.
    pub fn compact_if_idle(&self) -> Result<bool> {
        let threshold = self.journal.config().compact_threshold_bytes;
        let size = self.journal.size();
        if threshold == 0 || size < threshold {
            return Ok(false);
        }
        let Ok(_idle) = self.groups.try_write() else {
            return Ok(false);
        };
        self.journal.flush()?;
        self.pool.flush()?;
        self.journal.reset()?;
        info!(bytes = size, threshold, "Journal compacted");
        Ok(true)
    }

    /// Run the machine from `start` on a prepared state
    pub(super) async fn drive(&self, start: InsertStep, mut state: InsertState) -> Result<RowLocator> {
        let mut flux = Self::flux(start);
        match flux.run(&mut state).await? {
            FluxOutcome::Completed => {
                debug!(
                    table = %state.table.name(),
                    root = state.root,
                    locator = ?state.locator,
                    "Insert completed"
                );
                Ok(state.locator)
            }
            FluxOutcome::Aborted => Err(state
                .failure
                .take()
                .unwrap_or_else(|| aborted(start))),
        }
    }

    pub(super) fn journal(&self) -> &Arc<JournalWriter> {
        &self.journal
    }

    pub(super) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl std::fmt::Debug for InsertPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertPipeline")
            .field("journal", &self.journal.path())
            .finish_non_exhaustive()
    }
}
