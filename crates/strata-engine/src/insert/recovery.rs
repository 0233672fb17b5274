use super::pipeline::{InsertPipeline, InsertState};
use super::{InsertStep, InsertTicket};
use crate::catalog::{Catalog, TableHandle};
use crate::flux::FluxStep;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use strata_common::{Error, Result, RowLocator};
use strata_storage::{IncompleteGroup, JournalRecord, JournalVerifier};
use tracing::{info, warn};

/// What an unfinished insert managed to journal
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupProgress {
    pub locator: Option<RowLocator>,
    pub unique_done: HashSet<String>,
    pub table_index_done: bool,
    pub multi_done: HashSet<String>,
}

impl GroupProgress {
    pub fn from_group(group: &IncompleteGroup) -> Self {
        let mut progress = Self::default();
        for record in &group.records {
            match record {
                JournalRecord::InsertSlots { locator, .. } => progress.locator = Some(*locator),
                JournalRecord::UpdateUniqueIndexCheckpoint { column, .. } => {
                    progress.unique_done.insert(column.clone());
                }
                JournalRecord::UpdateTableIndexCheckpoint { .. } => {
                    progress.table_index_done = true;
                }
                JournalRecord::UpdateMultiIndexCheckpoint { column, .. } => {
                    progress.multi_done.insert(column.clone());
                }
                _ => {}
            }
        }
        progress
    }
}

/// First step whose effect is not known to be durable
pub fn resume_step(table: &TableHandle, ticket: &InsertTicket, progress: &GroupProgress) -> InsertStep {
    if progress.locator.is_none() {
        return InsertStep::CheckUniqueKeys;
    }
    let unique_pending = table
        .unique_indexes()
        .any(|(column, _)| ticket.present(column).is_some() && !progress.unique_done.contains(column));
    if unique_pending {
        return InsertStep::UpdateUniqueKeys;
    }
    if !progress.table_index_done {
        return InsertStep::InsertToPage;
    }
    let multi_pending = table
        .multi_indexes()
        .any(|(column, _)| ticket.present(column).is_some() && !progress.multi_done.contains(column));
    if multi_pending {
        return InsertStep::UpdateMultiIndexes;
    }
    InsertStep::CheckpointInsert
}

/// One replayed insert
#[derive(Clone, Debug, Serialize)]
pub struct ResumedInsert {
    pub root: u32,
    pub table: String,
    pub step: &'static str,
    pub completed: bool,
}

/// Outcome of a recovery pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Records read from the journal
    pub records: u64,
    /// Groups without a closing record
    pub incomplete: usize,
    pub resumed: Vec<ResumedInsert>,
}

impl RecoveryReport {
    pub fn completed(&self) -> usize {
        self.resumed.iter().filter(|r| r.completed).count()
    }

    pub fn aborted(&self) -> usize {
        self.resumed.iter().filter(|r| !r.completed).count()
    }
}

/// Replays unfinished inserts found in the journal
pub struct InsertRecoverer<'a> {
    catalog: &'a Catalog,
    pipeline: &'a InsertPipeline,
}

impl<'a> InsertRecoverer<'a> {
    pub fn new(catalog: &'a Catalog, pipeline: &'a InsertPipeline) -> Self {
        Self { catalog, pipeline }
    }

    /// Scan `records` and drive every open insert group to its end
    ///
    /// A record that cannot be read stops recovery with an error. Inserts
    /// that hit a constraint on replay are closed with an abort record.
    pub async fn recover(
        &self,
        records: impl IntoIterator<Item = Result<JournalRecord>>,
    ) -> Result<RecoveryReport> {
        let mut verifier = JournalVerifier::new();
        for record in records {
            verifier.observe(record?);
        }
        let mut report = RecoveryReport {
            records: verifier.observed(),
            ..RecoveryReport::default()
        };
        let groups = verifier.finish();
        report.incomplete = groups.len();

        for group in groups {
            report.resumed.push(self.resume(&group).await?);
        }

        if report.incomplete > 0 {
            info!(
                records = report.records,
                incomplete = report.incomplete,
                completed = report.completed(),
                aborted = report.aborted(),
                "Journal recovery finished"
            );
        }
        Ok(report)
    }

    async fn resume(&self, group: &IncompleteGroup) -> Result<ResumedInsert> {
        let Some(JournalRecord::Insert { table, values, .. }) = group.root_record() else {
            return Err(Error::JournalCorrupt {
                sequence: group.root,
                reason: "open group does not start with an insert".into(),
            });
        };
        let table: Arc<TableHandle> = self.catalog.table(table)?;
        let ticket = InsertTicket {
            table: table.name().to_string(),
            values: values.clone(),
        };

        let progress = GroupProgress::from_group(group);
        let step = resume_step(&table, &ticket, &progress);
        info!(
            root = group.root,
            table = %table.name(),
            step = ?step,
            "Resuming interrupted insert"
        );

        let _rows = table.rows_read().await;
        let mut state = InsertState::new(
            Arc::clone(&table),
            ticket,
            group.root,
            Arc::clone(self.pipeline.journal()),
            Arc::clone(self.pipeline.pool()),
        )
        .with_done(progress.unique_done, progress.multi_done);
        if let Some(locator) = progress.locator {
            state = state.with_locator(locator);
        }

        let completed = match self.pipeline.drive(step, state).await {
            Ok(_) => true,
            Err(e) if e.is_constraint_violation() => {
                warn!(root = group.root, error = %e, "Interrupted insert rejected on replay");
                false
            }
            Err(e) => return Err(e),
        };

        Ok(ResumedInsert {
            root: group.root,
            table: table.name().to_string(),
            step: step.name(),
            completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexTree;
    use crate::insert::Row;
    use crate::insert::pipeline::tests::{Fixture, fixture, ticket};
    use strata_storage::{IndexKey, JournalReader, Value};

    fn group(records: Vec<JournalRecord>) -> IncompleteGroup {
        IncompleteGroup { root: 1, records }
    }

    #[test]
    fn test_resume_step_rules() {
        let fx = fixture();
        let table = fx.catalog.table("users").unwrap();
        let full = ticket("a@x", "paris");
        let loc = RowLocator::from_slots(1, 50);
        let insert = JournalRecord::insert("users", full.values.clone());
        let slots = JournalRecord::insert_slots(1, loc);

        let at = |records: Vec<JournalRecord>| {
            resume_step(&table, &full, &GroupProgress::from_group(&group(records)))
        };

        assert_eq!(at(vec![insert.clone()]), InsertStep::CheckUniqueKeys);
        assert_eq!(
            at(vec![insert.clone(), slots.clone()]),
            InsertStep::UpdateUniqueKeys
        );
        assert_eq!(
            at(vec![
                insert.clone(),
                slots.clone(),
                JournalRecord::update_unique_index(1, "email"),
            ]),
            InsertStep::UpdateUniqueKeys
        );
        // handle has no value, so email alone completes the unique step
        assert_eq!(
            at(vec![
                insert.clone(),
                slots.clone(),
                JournalRecord::update_unique_index_checkpoint(3, "email"),
                JournalRecord::write_page(1, 50, vec![1]),
            ]),
            InsertStep::InsertToPage
        );
        assert_eq!(
            at(vec![
                insert.clone(),
                slots.clone(),
                JournalRecord::update_unique_index_checkpoint(3, "email"),
                JournalRecord::update_table_index_checkpoint(5),
            ]),
            InsertStep::UpdateMultiIndexes
        );
        assert_eq!(
            at(vec![
                insert,
                slots,
                JournalRecord::update_unique_index_checkpoint(3, "email"),
                JournalRecord::update_table_index_checkpoint(5),
                JournalRecord::update_multi_index_checkpoint(7, "city"),
            ]),
            InsertStep::CheckpointInsert
        );
    }

    /// Everything an insert leaves behind, for comparing two runs
    fn footprint(fx: &Fixture, loc: RowLocator) -> (Option<RowLocator>, Option<RowLocator>, Vec<RowLocator>, Row) {
        let table = fx.catalog.table("users").unwrap();
        let email = match &table.index("email").unwrap().tree {
            IndexTree::Unique(tree) => tree.get(&IndexKey::single(Value::from("a@x"))).unwrap(),
            IndexTree::Multi(_) => unreachable!(),
        };
        let row = table
            .row_index()
            .get(&IndexKey::single(Value::Id(loc.row_id)))
            .unwrap();
        let city = match &table.index("city").unwrap().tree {
            IndexTree::Multi(tree) => tree
                .get(&IndexKey::single(Value::from("paris")))
                .unwrap()
                .map(|list| list.as_slice().to_vec())
                .unwrap_or_default(),
            IndexTree::Unique(_) => unreachable!(),
        };
        let payload = Row::decode(&fx.pool.read_data(loc.page_offset().unwrap()).unwrap()).unwrap();
        (email, row, city, payload)
    }

    #[tokio::test]
    async fn test_replay_from_slots_matches_uninterrupted_insert() {
        // reference run
        let reference = fixture();
        let table = reference.catalog.table("users").unwrap();
        let expected_loc = reference
            .pipeline
            .insert(table, ticket("a@x", "paris"))
            .await
            .unwrap();

        // crashed run: the insert got as far as allocating its slots
        let fx = fixture();
        let t = ticket("a@x", "paris");
        let root = fx
            .journal
            .append(JournalRecord::insert("users", t.values.clone()))
            .unwrap();
        let loc = RowLocator::from_slots(fx.pool.next_row_id(), fx.pool.next_free_offset());
        fx.journal
            .append(JournalRecord::insert_slots(root, loc))
            .unwrap();
        fx.journal.flush().unwrap();

        let report = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(JournalReader::open(fx.journal.path()).unwrap())
            .await
            .unwrap();
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.resumed[0].step, "update_unique_keys");
        assert_eq!(report.completed(), 1);

        assert_eq!(loc, expected_loc);
        assert_eq!(footprint(&fx, loc), footprint(&reference, expected_loc));

        // the group is closed now
        fx.journal.flush().unwrap();
        let again = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(JournalReader::open(fx.journal.path()).unwrap())
            .await
            .unwrap();
        assert_eq!(again.incomplete, 0);
    }

    #[tokio::test]
    async fn test_replay_over_applied_effects_is_idempotent() {
        let fx = fixture();
        let table = fx.catalog.table("users").unwrap();
        let loc = fx
            .pipeline
            .insert(Arc::clone(&table), ticket("a@x", "paris"))
            .await
            .unwrap();
        let before = footprint(&fx, loc);

        // drop the records after the unique checkpoint, as if they never hit disk
        fx.journal.flush().unwrap();
        let records: Vec<JournalRecord> = JournalReader::open(fx.journal.path())
            .unwrap()
            .map(|r| r.unwrap())
            .take_while(|r| !matches!(r, JournalRecord::WritePage { .. }))
            .collect();
        assert!(matches!(
            records.last(),
            Some(JournalRecord::UpdateUniqueIndexCheckpoint { .. })
        ));

        let report = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(records.into_iter().map(Ok))
            .await
            .unwrap();
        assert_eq!(report.resumed[0].step, "insert_to_page");
        assert_eq!(report.completed(), 1);

        assert_eq!(footprint(&fx, loc), before);
        assert_eq!(table.row_index().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_from_insert_only_runs_whole_pipeline() {
        let fx = fixture();
        let t = ticket("a@x", "paris");
        fx.journal
            .append(JournalRecord::insert("users", t.values.clone()))
            .unwrap();
        fx.journal.flush().unwrap();

        let report = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(JournalReader::open(fx.journal.path()).unwrap())
            .await
            .unwrap();
        assert_eq!(report.resumed[0].step, "check_unique_keys");
        assert_eq!(fx.catalog.table("users").unwrap().row_index().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_fatal() {
        let fx = fixture();
        fx.journal
            .append(JournalRecord::insert("ghosts", vec![("a".into(), Value::Int(1))]))
            .unwrap();
        fx.journal.flush().unwrap();

        let err = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(JournalReader::open(fx.journal.path()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_orphan_group_is_corruption() {
        let fx = fixture();
        // parent 40 was never seen, so the slots record roots its own group
        let records = vec![Ok(JournalRecord::insert_slots(
            40,
            RowLocator::from_slots(1, 2),
        ))];
        let err = InsertRecoverer::new(&fx.catalog, &fx.pipeline)
            .recover(records)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JournalCorrupt { sequence: 40, .. }));
    }
}
