//! Per-table entry point for reads and record creation.

use crate::adapter::LocalStore;
use crate::cache::RecordCache;
use crate::database::Database;
use crate::id::random_id;
use crate::model::{PreparedKind, PreparedRecord, Record, RecordDraft};
use crate::query::{Condition, TableQuery};
use crate::raw::RawRecord;
use crate::schema::TableSchema;
use crate::{error::Result, Error, RecordId};
use std::sync::Arc;

/// Records of one table.
pub struct Collection<S: LocalStore> {
    database: Database<S>,
    cache: Arc<RecordCache>,
}

impl<S: LocalStore> std::fmt::Debug for Collection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("table", &self.table())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<S: LocalStore> Collection<S> {
    pub(crate) fn new(database: Database<S>, cache: Arc<RecordCache>) -> Self {
        Self { database, cache }
    }

    pub fn table(&self) -> &str {
        self.cache.table()
    }

    pub fn schema(&self) -> &TableSchema {
        self.cache.schema()
    }

    pub fn database(&self) -> &Database<S> {
        &self.database
    }

    /// Find a record by id, tombstones included.
    pub async fn find(&self, id: &str) -> Result<Record> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        match self.database.store().find(self.table(), id).await? {
            Some(raw) => Ok(self.cache.record_from_raw(raw)),
            None => Err(Error::RecordNotFound {
                table: self.table().to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Records matching every condition. Records marked as deleted are
    /// never returned.
    pub async fn query(&self, conditions: impl IntoIterator<Item = Condition>) -> Result<Vec<Record>> {
        let raws = self.database.store().query(&self.live_query(conditions)).await?;
        Ok(raws
            .into_iter()
            .map(|raw| self.cache.record_from_raw(raw))
            .collect())
    }

    /// Number of records [`Collection::query`] would return.
    pub async fn count(&self, conditions: impl IntoIterator<Item = Condition>) -> Result<usize> {
        self.database.store().count(&self.live_query(conditions)).await
    }

    fn live_query(&self, conditions: impl IntoIterator<Item = Condition>) -> TableQuery {
        conditions
            .into_iter()
            .fold(TableQuery::new(self.table()).not_deleted(), TableQuery::and)
    }

    /// Prepare creating a record with a random id.
    pub fn prepare_create<F>(&self, builder: F) -> Result<PreparedRecord>
    where
        F: FnOnce(&mut RecordDraft<'_>) -> Result<()>,
    {
        self.prepare_create_with_id(random_id(), builder)
    }

    /// Prepare creating a record with a caller-chosen id.
    pub fn prepare_create_with_id<F>(&self, id: impl Into<RecordId>, builder: F) -> Result<PreparedRecord>
    where
        F: FnOnce(&mut RecordDraft<'_>) -> Result<()>,
    {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidRecordId(format!("{}: empty id", self.table())));
        }

        let mut draft = RecordDraft::new(self.schema(), self.schema().blank_raw(id));
        builder(&mut draft)?;
        Ok(self.prepare_create_from_raw(draft.into_raw()))
    }

    /// Prepare inserting an already built raw as is.
    pub(crate) fn prepare_create_from_raw(&self, raw: RawRecord) -> PreparedRecord {
        let record = Record::from_raw(self.cache.schema().clone(), raw.clone());
        PreparedRecord::new(PreparedKind::Create, raw, record)
    }

    /// Handle for a raw read directly from the store.
    pub fn record_from_raw(&self, raw: RawRecord) -> Record {
        self.cache.record_from_raw(raw)
    }
}
