//! Record handles and deferred mutations.
//!
//! A [`Record`] is a shared handle to the cached state of one row. Mutations
//! are never applied to a handle directly: `prepare_*` methods build a
//! [`PreparedRecord`] describing the new raw, and
//! [`Database::batch`](crate::Database::batch) commits a list of them
//! atomically inside an action.

use crate::adapter::BatchOperation;
use crate::change_tracker::{mark_deleted, track_write};
use crate::raw::{ChangedColumns, RawRecord, SyncStatus};
use crate::schema::TableSchema;
use crate::{error::Result, Error, RecordId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct RecordInner {
    id: RecordId,
    table: Arc<TableSchema>,
    raw: RwLock<RawRecord>,
    /// Set while a prepared update of this record is not committed yet
    pending_update: AtomicBool,
}

/// Shared handle to one record.
///
/// Clones refer to the same record; the identity map hands out one handle
/// per record.
#[derive(Debug, Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

impl Record {
    pub(crate) fn from_raw(table: Arc<TableSchema>, raw: RawRecord) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                id: raw.id.clone(),
                table,
                raw: RwLock::new(raw),
                pending_update: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn table(&self) -> &str {
        &self.inner.table.name
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.raw.read().status
    }

    pub fn changed(&self) -> ChangedColumns {
        self.inner.raw.read().changed.clone()
    }

    /// Value of a column.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.inner.raw.read().get(column).cloned()
    }

    /// Copy of the current raw.
    pub fn raw(&self) -> RawRecord {
        self.inner.raw.read().clone()
    }

    /// Whether both handles refer to the same record.
    pub fn same_as(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether a prepared modification of this record awaits its batch.
    pub fn has_pending_update(&self) -> bool {
        self.inner.pending_update.load(Ordering::Acquire)
    }

    pub(crate) fn set_raw(&self, raw: RawRecord) {
        *self.inner.raw.write() = raw;
    }

    /// Prepare an update built by `builder`.
    ///
    /// Written columns are validated against the schema and tracked as
    /// changed. Fails if the record already has a prepared, uncommitted
    /// modification, or if it is marked as deleted.
    pub fn prepare_update<F>(&self, builder: F) -> Result<PreparedRecord>
    where
        F: FnOnce(&mut RecordDraft<'_>) -> Result<()>,
    {
        self.prepare(PreparedKind::Update, |raw, table| {
            let mut draft = RecordDraft::new(table, raw.clone());
            builder(&mut draft)?;
            let written = draft.written;
            let mut next = draft.raw;
            track_write(&table.name, &mut next, written.iter().map(String::as_str))?;
            Ok(next)
        })
    }

    /// Prepare marking this record as deleted. The tombstone stays until the
    /// deletion is pushed.
    pub fn prepare_mark_as_deleted(&self) -> Result<PreparedRecord> {
        self.prepare(PreparedKind::MarkAsDeleted, |raw, _| {
            let mut next = raw.clone();
            mark_deleted(&mut next);
            Ok(next)
        })
    }

    /// Prepare removing this record without leaving a tombstone. The
    /// deletion will not be synced.
    pub fn prepare_destroy_permanently(&self) -> Result<PreparedRecord> {
        let raw = self.raw();
        self.claim()?;
        Ok(PreparedRecord::new(PreparedKind::DestroyPermanently, raw, self.clone()))
    }

    fn prepare<F>(&self, kind: PreparedKind, build: F) -> Result<PreparedRecord>
    where
        F: FnOnce(&RawRecord, &TableSchema) -> Result<RawRecord>,
    {
        let current = self.raw();
        if current.status == SyncStatus::Deleted {
            return Err(Error::ModifyDeleted {
                table: self.table().to_string(),
                id: self.inner.id.clone(),
            });
        }

        self.claim()?;
        match build(&current, &self.inner.table) {
            Ok(raw) => Ok(PreparedRecord::new(kind, raw, self.clone())),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn claim(&self) -> Result<()> {
        if self.inner.pending_update.swap(true, Ordering::AcqRel) {
            return Err(Error::PendingUpdate {
                table: self.table().to_string(),
                id: self.inner.id.clone(),
            });
        }
        Ok(())
    }

    fn release(&self) {
        self.inner.pending_update.store(false, Ordering::Release);
    }
}

/// Mutable view of a raw handed to update and create builders.
#[derive(Debug)]
pub struct RecordDraft<'a> {
    table: &'a TableSchema,
    raw: RawRecord,
    written: BTreeSet<String>,
}

impl<'a> RecordDraft<'a> {
    pub(crate) fn new(table: &'a TableSchema, raw: RawRecord) -> Self {
        Self {
            table,
            raw,
            written: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.raw.id
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.raw.columns.get(column)
    }

    /// Write a column value, checked against the schema.
    pub fn set(&mut self, column: &str, value: Value) -> Result<()> {
        let schema = self.table.column(column).ok_or_else(|| Error::UnknownColumn {
            table: self.table.name.clone(),
            column: column.to_string(),
        })?;
        schema.validate(&value)?;
        self.raw.columns.insert(column.to_string(), value);
        self.written.insert(column.to_string());
        Ok(())
    }

    pub(crate) fn into_raw(self) -> RawRecord {
        self.raw
    }
}

/// What a prepared record does when committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedKind {
    Create,
    Update,
    MarkAsDeleted,
    DestroyPermanently,
}

/// A mutation waiting for [`Database::batch`](crate::Database::batch).
///
/// Dropping it without committing releases the record for new prepared
/// modifications.
#[derive(Debug)]
pub struct PreparedRecord {
    kind: PreparedKind,
    raw: RawRecord,
    record: Record,
}

impl PreparedRecord {
    pub(crate) fn new(kind: PreparedKind, raw: RawRecord, record: Record) -> Self {
        Self { kind, raw, record }
    }

    pub fn kind(&self) -> PreparedKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        self.record.table()
    }

    pub fn id(&self) -> &str {
        self.record.id()
    }

    /// Raw the record will hold once committed.
    pub fn raw(&self) -> &RawRecord {
        &self.raw
    }

    /// Handle of the affected record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub(crate) fn to_operation(&self) -> BatchOperation {
        let table = self.table().to_string();
        match self.kind {
            PreparedKind::Create => BatchOperation::Create {
                table,
                raw: self.raw.clone(),
            },
            PreparedKind::Update => BatchOperation::Update {
                table,
                raw: self.raw.clone(),
            },
            PreparedKind::MarkAsDeleted => BatchOperation::MarkAsDeleted {
                table,
                id: self.raw.id.clone(),
            },
            PreparedKind::DestroyPermanently => BatchOperation::DestroyPermanently {
                table,
                id: self.raw.id.clone(),
            },
        }
    }
}

impl Drop for PreparedRecord {
    fn drop(&mut self) {
        if self.kind != PreparedKind::Create {
            self.record.release();
        }
    }
}
