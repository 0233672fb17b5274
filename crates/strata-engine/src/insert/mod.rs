//! Insert pipeline
//!
//! An insert runs as a [`Flux`](crate::flux::Flux) over [`InsertStep`]:
//!
//! ```text
//!   CheckUniqueKeys → UpdateUniqueKeys → InsertToPage
//!       → UpdateTableIndex → UpdateMultiIndexes → CheckpointInsert
//! ```
//!
//! Every durable effect is journaled before it is applied, and each index
//! update is closed by a checkpoint record once its pages are flushed.
//! After a crash, [`InsertRecoverer`] reads which records of an unfinished
//! insert made it to the journal and resumes the pipeline at the first
//! step whose effect is not known to be durable.

mod pipeline;
mod recovery;

pub use pipeline::{InsertPipeline, InsertState};
pub use recovery::{GroupProgress, InsertRecoverer, RecoveryReport, ResumedInsert, resume_step};

use crate::catalog::TableSchema;
use crate::flux::FluxStep;
use std::collections::HashSet;
use strata_common::{Error, Result, RowLocator};
use strata_storage::codec::{Decoder, Encoder};
use strata_storage::{PAGE_PAYLOAD_CAPACITY, Value};

const ROW_FORMAT_VERSION: u8 = 1;

/// Insert pipeline steps, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InsertStep {
    CheckUniqueKeys,
    UpdateUniqueKeys,
    InsertToPage,
    UpdateTableIndex,
    UpdateMultiIndexes,
    CheckpointInsert,
}

impl FluxStep for InsertStep {
    const ORDER: &'static [Self] = &[
        Self::CheckUniqueKeys,
        Self::UpdateUniqueKeys,
        Self::InsertToPage,
        Self::UpdateTableIndex,
        Self::UpdateMultiIndexes,
        Self::CheckpointInsert,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::CheckUniqueKeys => "check_unique_keys",
            Self::UpdateUniqueKeys => "update_unique_keys",
            Self::InsertToPage => "insert_to_page",
            Self::UpdateTableIndex => "update_table_index",
            Self::UpdateMultiIndexes => "update_multi_indexes",
            Self::CheckpointInsert => "checkpoint_insert",
        }
    }
}

/// A row to insert: table name and column values
#[derive(Clone, Debug, PartialEq)]
pub struct InsertTicket {
    pub table: String,
    pub values: Vec<(String, Value)>,
}

impl InsertTicket {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
        }
    }

    /// Set a column value
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Value of a column; missing columns read as `None`
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Non-null value of a column
    pub fn present(&self, column: &str) -> Option<&Value> {
        self.value(column).filter(|v| !v.is_null())
    }

    /// Check the ticket against the table it targets
    pub fn validate(&self, schema: &TableSchema) -> Result<()> {
        if self.table != schema.name {
            return Err(Error::invalid_ticket(format!(
                "ticket for '{}' used on table '{}'",
                self.table, schema.name
            )));
        }
        if self.values.is_empty() {
            return Err(Error::invalid_ticket("no column values"));
        }

        let mut seen = HashSet::new();
        for (column, _) in &self.values {
            if schema.get_column(column).is_none() {
                return Err(Error::invalid_ticket(format!(
                    "unknown column '{column}' in table '{}'",
                    schema.name
                )));
            }
            if !seen.insert(column.as_str()) {
                return Err(Error::invalid_ticket(format!("column '{column}' given twice")));
            }
        }

        for column in schema.columns.iter().filter(|c| c.not_null) {
            if self.present(&column.name).is_none() {
                return Err(Error::invalid_ticket(format!(
                    "column '{}' requires a value",
                    column.name
                )));
            }
        }

        let size = self.encode_row(RowLocator::UNSET).len();
        if size > PAGE_PAYLOAD_CAPACITY {
            return Err(Error::invalid_ticket(format!(
                "row is {size} bytes, limit is {PAGE_PAYLOAD_CAPACITY}"
            )));
        }
        Ok(())
    }

    /// Row payload stored on the data page
    pub fn encode_row(&self, locator: RowLocator) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_u8(ROW_FORMAT_VERSION);
        enc.put_locator(&locator);
        enc.put_u16(self.values.len() as u16);
        for (column, value) in &self.values {
            enc.put_str(column);
            value.encode(&mut enc);
        }
        enc.finish()
    }
}

/// A stored row
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub locator: RowLocator,
    pub values: Vec<(String, Value)>,
}

impl Row {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let version = dec.get_u8()?;
        if version != ROW_FORMAT_VERSION {
            return Err(Error::deserialization(format!(
                "unsupported row format {version}"
            )));
        }
        let locator = dec.get_locator()?;
        let count = dec.get_u16()?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let column = dec.get_str()?;
            values.push((column, Value::decode(&mut dec)?));
        }
        dec.expect_end()?;
        Ok(Self { locator, values })
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexKind;

    fn schema() -> TableSchema {
        TableSchema::new("users")
            .required_column("email", IndexKind::Unique)
            .column("age", IndexKind::Multi)
    }

    #[test]
    fn test_validation() {
        let ok = InsertTicket::new("users").with("email", "a@x").with("age", 30_i64);
        assert!(ok.validate(&schema()).is_ok());

        let cases = [
            InsertTicket::new("other").with("email", "a@x"),
            InsertTicket::new("users"),
            InsertTicket::new("users").with("email", "a@x").with("nope", 1_i64),
            InsertTicket::new("users").with("email", "a@x").with("email", "b@x"),
            InsertTicket::new("users").with("age", 30_i64),
            InsertTicket::new("users").with("email", Value::Null),
            InsertTicket::new("users").with("email", "x".repeat(PAGE_PAYLOAD_CAPACITY)),
        ];
        for ticket in cases {
            assert!(
                matches!(ticket.validate(&schema()), Err(Error::InvalidTicket(_))),
                "{ticket:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_row_payload() {
        let ticket = InsertTicket::new("users")
            .with("email", "a@x")
            .with("age", Value::Null);
        let loc = RowLocator::from_slots(3, 40);
        let row = Row::decode(&ticket.encode_row(loc)).unwrap();
        assert_eq!(row.locator, loc);
        assert_eq!(row.values, ticket.values);
        assert_eq!(row.get("email"), Some(&Value::Text("a@x".into())));
        assert!(Row::decode(&[9, 0, 0]).is_err());
    }

    #[test]
    fn test_step_order() {
        assert_eq!(InsertStep::ORDER.len(), 6);
        assert_eq!(InsertStep::CheckUniqueKeys.position(), Some(0));
        assert_eq!(InsertStep::CheckpointInsert.position(), Some(5));
    }
}
