//! Contract of the physical storage underneath a [`Database`](crate::Database).
//!
//! A [`LocalStore`] persists raws per table, evaluates [`TableQuery`]s,
//! applies batches atomically and holds a small string key/value area for
//! metadata such as the last pull timestamp. It knows nothing about actions,
//! change tracking or sync; those are layered on top by the engine.

use crate::query::TableQuery;
use crate::raw::RawRecord;
use crate::schema::AppSchema;
use crate::{error::Result, RecordId, TableName};
use std::future::Future;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Insert a raw; the id must not exist yet.
    Create { table: TableName, raw: RawRecord },
    /// Replace a raw; the id must exist.
    Update { table: TableName, raw: RawRecord },
    /// Tombstone a record, keeping it until the deletion is pushed.
    MarkAsDeleted { table: TableName, id: RecordId },
    /// Remove a record. Removing a missing record is a no-op.
    DestroyPermanently { table: TableName, id: RecordId },
}

impl BatchOperation {
    pub fn table(&self) -> &str {
        match self {
            BatchOperation::Create { table, .. }
            | BatchOperation::Update { table, .. }
            | BatchOperation::MarkAsDeleted { table, .. }
            | BatchOperation::DestroyPermanently { table, .. } => table,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BatchOperation::Create { raw, .. } | BatchOperation::Update { raw, .. } => &raw.id,
            BatchOperation::MarkAsDeleted { id, .. }
            | BatchOperation::DestroyPermanently { id, .. } => id,
        }
    }

    /// Name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Create { .. } => "create",
            BatchOperation::Update { .. } => "update",
            BatchOperation::MarkAsDeleted { .. } => "markAsDeleted",
            BatchOperation::DestroyPermanently { .. } => "destroyPermanently",
        }
    }
}

/// Storage backend of a local replica.
///
/// Implementations must be safe to share between tasks. Reads may run at any
/// time, including while an action is writing; `batch` must be atomic.
pub trait LocalStore: Send + Sync + 'static {
    /// Schema the store was opened with.
    fn schema(&self) -> &AppSchema;

    /// Raw of a single record, tombstones included.
    fn find(
        &self,
        table: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<RawRecord>>> + Send;

    /// Raws matching a query, ordered by id.
    fn query(&self, query: &TableQuery) -> impl Future<Output = Result<Vec<RawRecord>>> + Send;

    /// Number of raws matching a query.
    fn count(&self, query: &TableQuery) -> impl Future<Output = Result<usize>> + Send;

    /// Apply every operation or none of them.
    fn batch(&self, operations: Vec<BatchOperation>) -> impl Future<Output = Result<()>> + Send;

    /// Read a value from the local key/value area.
    fn get_local(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Write a value to the local key/value area.
    fn set_local(&self, key: &str, value: String) -> impl Future<Output = Result<()>> + Send;

    /// Remove every raw of every table and the whole local key/value area.
    fn unsafe_reset_database(&self) -> impl Future<Output = Result<()>> + Send;
}
