//! The database: a [`LocalStore`] plus the machinery that makes writes safe.
//!
//! Writes go through [`Database::batch`] inside an action of the database's
//! [`ActionQueue`]. After each committed batch the identity map is updated
//! and a list of [`CollectionChange`]s is broadcast to subscribers.

use crate::action_queue::{Action, ActionQueue};
use crate::adapter::{BatchOperation, LocalStore};
use crate::cache::RecordCache;
use crate::collection::Collection;
use crate::model::{PreparedKind, PreparedRecord, Record, RecordDraft};
use crate::raw::SyncStatus;
use crate::schema::AppSchema;
use crate::{error::Result, Error, RecordId, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the change feed before slow subscribers start lagging.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Kind of a committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Destroyed,
}

/// One committed change to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionChange {
    pub table: TableName,
    pub id: RecordId,
    pub kind: ChangeKind,
}

impl CollectionChange {
    fn from_operation(op: &BatchOperation) -> Self {
        let kind = match op {
            BatchOperation::Create { .. } => ChangeKind::Created,
            BatchOperation::Update { .. } => ChangeKind::Updated,
            BatchOperation::MarkAsDeleted { .. } | BatchOperation::DestroyPermanently { .. } => {
                ChangeKind::Destroyed
            }
        };
        Self {
            table: op.table().to_string(),
            id: op.id().to_string(),
            kind,
        }
    }
}

struct DatabaseInner<S> {
    store: S,
    queue: ActionQueue,
    caches: HashMap<TableName, Arc<RecordCache>>,
    changes: broadcast::Sender<Vec<CollectionChange>>,
}

/// Handle to a local database. Clones share the same state.
pub struct Database<S: LocalStore> {
    inner: Arc<DatabaseInner<S>>,
}

impl<S: LocalStore> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: LocalStore> std::fmt::Debug for Database<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema_version", &self.schema().version)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl<S: LocalStore> Database<S> {
    /// Open a database over `store`, using the store's schema.
    pub fn new(store: S) -> Self {
        let caches = store
            .schema()
            .tables()
            .map(|t| {
                (
                    t.name.clone(),
                    Arc::new(RecordCache::new(Arc::new(t.clone()))),
                )
            })
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Self {
            inner: Arc::new(DatabaseInner {
                store,
                queue: ActionQueue::new(),
                caches,
                changes,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn schema(&self) -> &AppSchema {
        self.inner.store.schema()
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.inner.queue
    }

    /// Run `work` as a top-level action.
    pub async fn action<T, F, Fut>(&self, label: impl Into<String>, work: F) -> Result<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.queue.enqueue(label, work).await
    }

    pub fn collection(&self, table: &str) -> Result<Collection<S>> {
        Ok(Collection::new(self.clone(), self.cache(table)?.clone()))
    }

    pub(crate) fn cache(&self, table: &str) -> Result<&Arc<RecordCache>> {
        self.inner
            .caches
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    /// Subscribe to committed changes, one message per batch.
    pub fn changes(&self) -> broadcast::Receiver<Vec<CollectionChange>> {
        self.inner.changes.subscribe()
    }

    /// Commit prepared records atomically.
    pub async fn batch(&self, action: &Action, records: Vec<PreparedRecord>) -> Result<()> {
        self.inner.queue.ensure_in_action(
            action,
            "Database::batch() can only be called from inside of an action",
        )?;

        let operations = records.iter().map(PreparedRecord::to_operation).collect();
        self.commit(operations).await?;

        for prepared in &records {
            match prepared.kind() {
                PreparedKind::Create => {
                    prepared.record().set_raw(prepared.raw().clone());
                    self.cache(prepared.table())?.add(prepared.record().clone());
                }
                PreparedKind::Update | PreparedKind::MarkAsDeleted => {
                    prepared.record().set_raw(prepared.raw().clone());
                }
                PreparedKind::DestroyPermanently => {}
            }
        }
        Ok(())
    }

    /// Commit raw operations built by sync, bypassing record handles.
    pub(crate) async fn apply_operations(
        &self,
        action: &Action,
        operations: Vec<BatchOperation>,
    ) -> Result<()> {
        self.inner.queue.ensure_in_action(
            action,
            "local changes can only be written from inside of an action",
        )?;
        self.commit(operations).await
    }

    async fn commit(&self, operations: Vec<BatchOperation>) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        for op in &operations {
            self.cache(op.table())?;
        }

        self.inner.store.batch(operations.clone()).await?;

        for op in &operations {
            let cache = self.cache(op.table())?;
            match op {
                BatchOperation::Create { raw, .. } | BatchOperation::Update { raw, .. } => {
                    cache.upsert(raw)
                }
                BatchOperation::MarkAsDeleted { id, .. } => {
                    if let Some(record) = cache.get(id) {
                        let mut raw = record.raw();
                        raw.status = SyncStatus::Deleted;
                        record.set_raw(raw);
                    }
                }
                BatchOperation::DestroyPermanently { id, .. } => cache.delete(id),
            }
        }

        let changes: Vec<_> = operations.iter().map(CollectionChange::from_operation).collect();
        debug!(changes = changes.len(), "batch committed");
        // No subscribers is fine.
        let _ = self.inner.changes.send(changes);
        Ok(())
    }

    /// Create a record in `table` and return its handle.
    pub async fn create<F>(&self, action: &Action, table: &str, builder: F) -> Result<Record>
    where
        F: FnOnce(&mut RecordDraft<'_>) -> Result<()>,
    {
        let prepared = self.collection(table)?.prepare_create(builder)?;
        let record = prepared.record().clone();
        self.batch(action, vec![prepared]).await?;
        Ok(record)
    }

    pub async fn update<F>(&self, action: &Action, record: &Record, builder: F) -> Result<()>
    where
        F: FnOnce(&mut RecordDraft<'_>) -> Result<()>,
    {
        let prepared = record.prepare_update(builder)?;
        self.batch(action, vec![prepared]).await
    }

    pub async fn mark_as_deleted(&self, action: &Action, record: &Record) -> Result<()> {
        let prepared = record.prepare_mark_as_deleted()?;
        self.batch(action, vec![prepared]).await
    }

    pub async fn destroy_permanently(&self, action: &Action, record: &Record) -> Result<()> {
        let prepared = record.prepare_destroy_permanently()?;
        self.batch(action, vec![prepared]).await
    }

    pub async fn get_local(&self, key: &str) -> Result<Option<String>> {
        self.inner.store.get_local(key).await
    }

    pub async fn set_local(&self, action: &Action, key: &str, value: String) -> Result<()> {
        self.inner.queue.ensure_in_action(
            action,
            "Database::set_local() can only be called from inside of an action",
        )?;
        self.inner.store.set_local(key, value).await
    }

    /// Wipe every record and the local key/value area, including the last
    /// pull timestamp, so that the next sync starts from scratch.
    ///
    /// Record handles obtained before the reset are no longer tracked.
    pub async fn unsafe_reset_database(&self, action: &Action) -> Result<()> {
        self.inner.queue.ensure_in_action(
            action,
            "Database::unsafe_reset_database() can only be called from inside of an action",
        )?;

        warn!("resetting database");
        self.inner.store.unsafe_reset_database().await?;
        self.unsafe_clear_caches();
        Ok(())
    }

    /// Drop every cached record handle.
    pub fn unsafe_clear_caches(&self) {
        for cache in self.inner.caches.values() {
            cache.clear();
        }
    }
}
