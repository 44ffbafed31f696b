//! Identity map of record handles, one per table.

use crate::model::Record;
use crate::raw::RawRecord;
use crate::schema::TableSchema;
use crate::RecordId;
use dashmap::DashMap;
use std::sync::Arc;

/// Keeps at most one [`Record`] handle per id, so every reader of a record
/// observes committed writes.
#[derive(Debug)]
pub struct RecordCache {
    table: Arc<TableSchema>,
    records: DashMap<RecordId, Record>,
}

impl RecordCache {
    pub fn new(table: Arc<TableSchema>) -> Self {
        Self {
            table,
            records: DashMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table.name
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn add(&self, record: Record) {
        self.records.insert(record.id().to_string(), record);
    }

    pub fn delete(&self, id: &str) {
        self.records.remove(id);
    }

    /// Forget every handle. Handles held elsewhere stop being tracked.
    pub fn clear(&self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Handle for a raw read from the store.
    ///
    /// A cached handle is returned as is: every committed batch upserts the
    /// handles it wrote, so a cached handle is never older than the store.
    pub fn record_from_raw(&self, raw: RawRecord) -> Record {
        self.records
            .entry(raw.id.clone())
            .or_insert_with(|| Record::from_raw(self.table.clone(), raw))
            .value()
            .clone()
    }

    /// Bring the handle of a committed raw up to date, caching it if needed.
    pub(crate) fn upsert(&self, raw: &RawRecord) {
        self.records
            .entry(raw.id.clone())
            .and_modify(|record| record.set_raw(raw.clone()))
            .or_insert_with(|| Record::from_raw(self.table.clone(), raw.clone()));
    }
}
