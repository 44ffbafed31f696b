//! Error types for the Tandem engine.

use crate::{ColumnName, RecordId, SchemaVersion, TableName};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Precondition violations
    #[error("not in action: {0}")]
    NotInAction(String),

    #[error("record {table}#{id} already has a pending update")]
    PendingUpdate { table: TableName, id: RecordId },

    #[error("cannot modify deleted record {table}#{id}")]
    ModifyDeleted { table: TableName, id: RecordId },

    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("unknown column '{column}' in table {table}")]
    UnknownColumn { table: TableName, column: ColumnName },

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: ColumnName,
        expected: String,
        got: String,
    },

    // Lookup and storage errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("record not found: {table}#{id}")]
    RecordNotFound { table: TableName, id: RecordId },

    #[error("record already exists: {table}#{id}")]
    RecordAlreadyExists { table: TableName, id: RecordId },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    // Sync errors
    #[error(
        "concurrent synchronization is not allowed: another synchronize() committed \
         or is running, this one was aborted before writing to the local database"
    )]
    ConcurrentSync,

    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Whether this error is a violated precondition (a caller bug, not retried).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotInAction(_)
                | Error::PendingUpdate { .. }
                | Error::ModifyDeleted { .. }
                | Error::InvalidRecordId(_)
                | Error::UnknownColumn { .. }
                | Error::TypeMismatch { .. }
        )
    }

    /// Whether retrying the whole operation later may succeed.
    ///
    /// Sync is safely re-driveable, so concurrency conflicts and transport
    /// failures are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentSync | Error::Remote(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
