//! In-memory [`LocalStore`].
//!
//! Tables are ordered maps of raws guarded by one lock. A batch is applied in
//! place while the previous value of every touched row is logged; if an
//! operation fails the log is replayed backwards, so a failing batch leaves
//! the store untouched.

use crate::adapter::{BatchOperation, LocalStore};
use crate::query::TableQuery;
use crate::raw::{RawRecord, SyncStatus};
use crate::schema::AppSchema;
use crate::snapshot::StoreSnapshot;
use crate::{error::Result, Error, RecordId, TableName};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

type Table = BTreeMap<RecordId, RawRecord>;

/// Reference store keeping every raw in memory.
#[derive(Debug)]
pub struct MemoryStore {
    schema: AppSchema,
    tables: RwLock<HashMap<TableName, Table>>,
    local: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store with one table per schema table.
    pub fn new(schema: AppSchema) -> Self {
        let tables = schema
            .tables()
            .map(|t| (t.name.clone(), Table::new()))
            .collect();
        Self {
            schema,
            tables: RwLock::new(tables),
            local: RwLock::new(BTreeMap::new()),
        }
    }

    /// Copy the whole store, including the local key/value area.
    pub fn export_snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(self.schema.version);
        for (table, raws) in self.tables.read().iter() {
            let entry = snapshot.tables.entry(table.clone()).or_default();
            for (id, raw) in raws {
                entry.insert(id.clone(), raw.to_dirty());
            }
        }
        snapshot.local = self.local.read().clone();
        snapshot
    }

    /// Open a store from a snapshot taken with the same schema version.
    ///
    /// Raws are sanitized against the schema, so columns added since the
    /// snapshot was taken get their default value.
    pub fn import_snapshot(schema: AppSchema, snapshot: StoreSnapshot) -> Result<Self> {
        snapshot.validate(&schema)?;

        let store = Self::new(schema);
        {
            let mut tables = store.tables.write();
            for (name, raws) in &snapshot.tables {
                let table_schema = store.schema.require_table(name)?;
                let table = tables.entry(name.clone()).or_default();
                for raw in raws.values() {
                    let raw = table_schema.sanitize(raw)?;
                    table.insert(raw.id.clone(), raw);
                }
            }
        }
        *store.local.write() = snapshot.local;
        Ok(store)
    }

    /// Number of raws across all tables, tombstones included.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_now(&self, table: &str, id: &str) -> Result<Option<RawRecord>> {
        self.schema.require_table(table)?;
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(id))
            .cloned())
    }

    fn query_now(&self, query: &TableQuery) -> Result<Vec<RawRecord>> {
        self.schema.require_table(&query.table)?;
        Ok(self
            .tables
            .read()
            .get(&query.table)
            .map(|t| t.values().filter(|raw| query.matches(raw)).cloned().collect())
            .unwrap_or_default())
    }

    fn batch_now(&self, operations: Vec<BatchOperation>) -> Result<()> {
        for op in &operations {
            self.schema.require_table(op.table())?;
        }

        let mut tables = self.tables.write();
        let mut undo: Vec<(TableName, RecordId, Option<RawRecord>)> = Vec::new();
        for op in operations {
            let name = op.table().to_string();
            let table = tables.entry(name.clone()).or_default();
            trace!(table = %name, id = op.id(), op = op.kind(), "batch operation");
            let id = op.id().to_string();
            let previous = table.get(&id).cloned();
            if let Err(e) = apply(table, &name, op) {
                rollback(&mut tables, undo);
                return Err(e);
            }
            undo.push((name, id, previous));
        }
        Ok(())
    }
}

/// Restore the rows a partially applied batch wrote, newest first.
fn rollback(
    tables: &mut HashMap<TableName, Table>,
    undo: Vec<(TableName, RecordId, Option<RawRecord>)>,
) {
    for (name, id, previous) in undo.into_iter().rev() {
        let Some(table) = tables.get_mut(&name) else {
            continue;
        };
        match previous {
            Some(raw) => {
                table.insert(id, raw);
            }
            None => {
                table.remove(&id);
            }
        }
    }
}

fn apply(table: &mut Table, name: &str, op: BatchOperation) -> Result<()> {
    match op {
        BatchOperation::Create { raw, .. } => {
            if table.contains_key(&raw.id) {
                return Err(Error::RecordAlreadyExists {
                    table: name.to_string(),
                    id: raw.id,
                });
            }
            table.insert(raw.id.clone(), raw);
        }
        BatchOperation::Update { raw, .. } => match table.get_mut(&raw.id) {
            Some(slot) => *slot = raw,
            None => {
                return Err(Error::RecordNotFound {
                    table: name.to_string(),
                    id: raw.id,
                })
            }
        },
        BatchOperation::MarkAsDeleted { id, .. } => match table.get_mut(&id) {
            Some(raw) => raw.status = SyncStatus::Deleted,
            None => {
                return Err(Error::RecordNotFound {
                    table: name.to_string(),
                    id,
                })
            }
        },
        BatchOperation::DestroyPermanently { id, .. } => {
            table.remove(&id);
        }
    }
    Ok(())
}

impl LocalStore for MemoryStore {
    fn schema(&self) -> &AppSchema {
        &self.schema
    }

    async fn find(&self, table: &str, id: &str) -> Result<Option<RawRecord>> {
        self.find_now(table, id)
    }

    async fn query(&self, query: &TableQuery) -> Result<Vec<RawRecord>> {
        self.query_now(query)
    }

    async fn count(&self, query: &TableQuery) -> Result<usize> {
        self.query_now(query).map(|raws| raws.len())
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<()> {
        self.batch_now(operations)
    }

    async fn get_local(&self, key: &str) -> Result<Option<String>> {
        Ok(self.local.read().get(key).cloned())
    }

    async fn set_local(&self, key: &str, value: String) -> Result<()> {
        self.local.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn unsafe_reset_database(&self) -> Result<()> {
        let mut tables = self.tables.write();
        for table in tables.values_mut() {
            table.clear();
        }
        self.local.write().clear();
        Ok(())
    }
}
