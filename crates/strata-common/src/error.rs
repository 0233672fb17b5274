//! Error types for Strata
//!
//! This module defines the common error types used throughout the engine.

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("page {offset} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("page {offset} is out of range for this store")]
    PageOutOfRange { offset: u64 },

    // Journal errors
    #[error("journal frame truncated at byte {position}")]
    JournalTruncated { position: u64 },

    #[error("journal frame {sequence} corrupted: {reason}")]
    JournalCorrupt { sequence: u32, reason: String },

    #[error("unknown journal record type: {0}")]
    UnknownRecordType(i16),

    // Validation errors
    #[error("invalid insert ticket: {0}")]
    InvalidTicket(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Constraint errors
    #[error("duplicate key on {table}.{column}: {value}")]
    DuplicateKey {
        table: String,
        column: String,
        value: String,
    },

    // Catalog errors
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("index not found: {table}.{column}")]
    IndexNotFound { table: String, column: String },

    #[error("null value for not-null column {table}.{column}")]
    NullValue { table: String, column: String },

    // Transaction errors
    #[error("transaction {0} is no longer active")]
    TransactionClosed(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    // Internal errors
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected end of input at byte {position}, needed {needed} more")]
    UnexpectedEof { position: usize, needed: usize },
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid ticket error
    pub fn invalid_ticket(msg: impl Into<String>) -> Self {
        Self::InvalidTicket(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Only plain I/O failures qualify; constraint violations, corruption and
    /// invariant violations are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DiskIo(_))
    }

    /// Check if this error signals on-disk corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::JournalTruncated { .. }
                | Self::JournalCorrupt { .. }
        )
    }

    /// Check if this is a constraint violation
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. } | Self::NullValue { .. })
    }

    /// Stable error code surfaced to the command-execution layer
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTicket(_) | Self::InvalidArgument(_) => "InvalidInput",
            Self::DuplicateKey { .. } => "DuplicateKey",
            Self::NullValue { .. } => "NullConstraint",
            Self::TableNotFound(_) => "NoSuchTable",
            Self::TableAlreadyExists(_) => "TableExists",
            Self::IndexNotFound { .. } => "NoSuchIndex",
            Self::ChecksumMismatch { .. } => "PageCorrupt",
            Self::JournalTruncated { .. } | Self::JournalCorrupt { .. } => "JournalCorrupt",
            Self::UnknownRecordType(_) => "JournalUnsupported",
            Self::TransactionClosed(_) => "TransactionClosed",
            Self::Aborted(_) => "Aborted",
            Self::DiskIo(_) | Self::Storage(_) | Self::PageOutOfRange { .. } => "StorageError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Internal(_)
            | Self::Serialization(_)
            | Self::Deserialization(_)
            | Self::UnexpectedEof { .. } => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let io = Error::DiskIo(std::io::Error::other("boom"));
        assert!(io.is_retryable());
        assert!(
            !Error::DuplicateKey {
                table: "t".into(),
                column: "c".into(),
                value: "1".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_codes_are_distinct_for_corruption() {
        let page = Error::ChecksumMismatch {
            offset: 3,
            expected: 1,
            actual: 2,
        };
        let journal = Error::JournalTruncated { position: 10 };
        assert!(page.is_corruption());
        assert!(journal.is_corruption());
        assert_ne!(page.error_code(), journal.error_code());
    }

    #[test]
    fn test_constraint_violation() {
        let err = Error::NullValue {
            table: "users".into(),
            column: "email".into(),
        };
        assert!(err.is_constraint_violation());
        assert_eq!(err.error_code(), "NullConstraint");
    }
}
