use super::record::JournalRecord;
use std::collections::{BTreeMap, HashMap};
use strata_common::Result;
use tracing::debug;

/// Records of one operation that never reached its closing record
#[derive(Clone, Debug, PartialEq)]
pub struct IncompleteGroup {
    /// Sequence of the record that started the operation
    pub root: u32,
    /// Records in append order
    pub records: Vec<JournalRecord>,
}

impl IncompleteGroup {
    /// The record that started the operation, if it is in the log
    pub fn root_record(&self) -> Option<&JournalRecord> {
        self.records.iter().find(|r| r.sequence() == self.root)
    }
}

/// Groups journal records by root operation and keeps the unfinished ones
#[derive(Default)]
pub struct JournalVerifier {
    /// sequence -> root sequence
    roots: HashMap<u32, u32>,
    open: BTreeMap<u32, Vec<JournalRecord>>,
    observed: u64,
}

impl JournalVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record
    pub fn observe(&mut self, record: JournalRecord) {
        self.observed += 1;
        let sequence = record.sequence();
        let root = match record.related() {
            None => sequence,
            Some(parent) => self.roots.get(&parent).copied().unwrap_or(parent),
        };
        self.roots.insert(sequence, root);

        if record.closes_group() {
            if let Some(group) = self.open.remove(&root) {
                debug!(root, records = group.len(), "Journal group closed");
            }
            return;
        }
        self.open.entry(root).or_default().push(record);
    }

    /// Groups still open, in root sequence order
    pub fn finish(self) -> Vec<IncompleteGroup> {
        self.open
            .into_iter()
            .map(|(root, records)| IncompleteGroup { root, records })
            .collect()
    }

    /// Records fed so far
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Scan a whole log, failing on the first unreadable record
    pub fn verify(
        records: impl IntoIterator<Item = Result<JournalRecord>>,
    ) -> Result<Vec<IncompleteGroup>> {
        let mut verifier = Self::new();
        for record in records {
            verifier.observe(record?);
        }
        Ok(verifier.finish())
    }
}
