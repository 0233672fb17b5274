//! Transactions
//!
//! A transaction is identified by an HLC timestamp. Inserts are buffered as
//! a page write plus row and index deltas; commit applies the deltas through
//! the B-trees and then the page writes as one batch. Rollback drops them.
//! Transactions are not journaled: a commit is durable once its pool flush
//! returns.

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{IndexDelta, RowDelta, Transaction, TransactionState, TxnStatus};
