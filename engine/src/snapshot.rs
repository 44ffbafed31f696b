//! Snapshot types for persisting and restoring a [`MemoryStore`](crate::MemoryStore).
//!
//! Raws are stored in their flat persisted form (`id`, `_status`,
//! `_changed`, one key per column). BTreeMaps keep the serialized JSON
//! deterministic.

use crate::raw::{DirtyRaw, SyncStatus, CHANGED_COLUMN, ID_COLUMN, STATUS_COLUMN};
use crate::schema::AppSchema;
use crate::{error::Result, Error, RecordId, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Raws by table, then by record id
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, DirtyRaw>>,
    /// Local key/value area
    #[serde(default)]
    pub local: BTreeMap<String, String>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: BTreeMap::new(),
            local: BTreeMap::new(),
        }
    }

    /// Add a persisted raw. Raws without a string id are ignored.
    pub fn add_raw(&mut self, table: impl Into<TableName>, raw: DirtyRaw) {
        let Some(id) = raw.get(ID_COLUMN).and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        self.tables.entry(table.into()).or_default().insert(id, raw);
    }

    pub fn get_raw(&self, table: &str, id: &str) -> Option<&DirtyRaw> {
        self.tables.get(table)?.get(id)
    }

    /// Count raws across all tables, tombstones included.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Count raws with something left to push.
    pub fn pending_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(BTreeMap::values)
            .filter(|raw| status_of(raw) != Some(SyncStatus::Synced))
            .count()
    }

    /// Validate the snapshot against a schema.
    ///
    /// Column values are not type checked: they are sanitized on import.
    pub fn validate(&self, schema: &AppSchema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for (table, raws) in &self.tables {
            schema.require_table(table)?;
            for (id, raw) in raws {
                if raw.get(ID_COLUMN).and_then(Value::as_str) != Some(id.as_str()) {
                    return Err(Error::InvalidSnapshot(format!(
                        "raw stored under {table}#{id} has a different id"
                    )));
                }
                if status_of(raw).is_none() {
                    return Err(Error::InvalidSnapshot(format!(
                        "raw {table}#{id} has no valid {STATUS_COLUMN}"
                    )));
                }
                if let Some(changed) = raw.get(CHANGED_COLUMN) {
                    if !changed.is_string() {
                        return Err(Error::InvalidSnapshot(format!(
                            "raw {table}#{id} has a non-string {CHANGED_COLUMN}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

fn status_of(raw: &DirtyRaw) -> Option<SyncStatus> {
    raw.get(STATUS_COLUMN)?.as_str()?.parse().ok()
}
