//! Raw record representation and change-tracking metadata.

use crate::{ColumnName, Error, RecordId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Unsanitized raw as received from a remote or read from persisted JSON.
pub type DirtyRaw = serde_json::Map<String, Value>;

/// Persisted column holding the sync status.
pub const STATUS_COLUMN: &str = "_status";
/// Persisted column holding the comma-delimited changed columns.
pub const CHANGED_COLUMN: &str = "_changed";
/// Column holding the record id.
pub const ID_COLUMN: &str = "id";

/// Sync status of a record relative to the last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Created locally, never pushed
    Created,
    /// Modified locally since the last sync
    Updated,
    /// Identical to the last known server version
    Synced,
    /// Tombstoned locally, deletion not pushed yet
    Deleted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Created => "created",
            SyncStatus::Updated => "updated",
            SyncStatus::Synced => "synced",
            SyncStatus::Deleted => "deleted",
        }
    }

    /// Whether a record with this status has something to push.
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SyncStatus::Created),
            "updated" => Ok(SyncStatus::Updated),
            "synced" => Ok(SyncStatus::Synced),
            "deleted" => Ok(SyncStatus::Deleted),
            other => Err(Error::Storage(format!("unknown sync status: {other}"))),
        }
    }
}

/// Set of column names modified locally since the last sync.
///
/// Persisted as a comma-delimited string (`"name,age"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedColumns(BTreeSet<ColumnName>);

impl ChangedColumns {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, column: impl Into<ColumnName>) -> bool {
        self.0.insert(column.into())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// True if every column in `self` is also in `other`.
    pub fn is_subset(&self, other: &ChangedColumns) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl<S: Into<ColumnName>> FromIterator<S> for ChangedColumns {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<ColumnName>> Extend<S> for ChangedColumns {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

impl fmt::Display for ChangedColumns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for column in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(column)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ChangedColumns {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect())
    }
}

impl Serialize for ChangedColumns {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangedColumns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// One row of application data, as held by a [`LocalStore`](crate::LocalStore).
///
/// `columns` holds the values of columns declared in the table schema,
/// `extra` holds any other keys verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: RecordId,
    pub status: SyncStatus,
    pub changed: ChangedColumns,
    pub columns: BTreeMap<ColumnName, Value>,
    pub extra: BTreeMap<String, Value>,
}

impl RawRecord {
    /// A new locally created raw with no values yet.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            status: SyncStatus::Created,
            changed: ChangedColumns::new(),
            columns: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Value of a column or extension key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.columns.get(key).or_else(|| self.extra.get(key))
    }

    /// Value of any key including the `id` and `_status` pseudo-columns.
    pub fn lookup(&self, key: &str) -> Option<Cow<'_, Value>> {
        match key {
            ID_COLUMN => Some(Cow::Owned(Value::String(self.id.clone()))),
            STATUS_COLUMN => Some(Cow::Owned(Value::String(self.status.as_str().into()))),
            CHANGED_COLUMN => Some(Cow::Owned(Value::String(self.changed.to_string()))),
            _ => self.get(key).map(Cow::Borrowed),
        }
    }

    /// Set a value, keeping it in `columns` if that column is known.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.columns.get_mut(key) {
            *slot = value;
        } else {
            self.extra.insert(key.to_string(), value);
        }
    }

    /// Whether both raws hold the same column and extension values.
    pub fn content_eq(&self, other: &RawRecord) -> bool {
        self.columns == other.columns && self.extra == other.extra
    }

    /// Full persisted form, including `_status` and `_changed`.
    pub fn to_dirty(&self) -> DirtyRaw {
        let mut raw = self.to_sync_payload();
        raw.insert(
            STATUS_COLUMN.to_string(),
            Value::String(self.status.as_str().into()),
        );
        raw.insert(
            CHANGED_COLUMN.to_string(),
            Value::String(self.changed.to_string()),
        );
        raw
    }

    /// Form sent to the server: `id` and values, sync metadata stripped.
    pub fn to_sync_payload(&self) -> DirtyRaw {
        let mut raw = DirtyRaw::new();
        for (key, value) in self.extra.iter().chain(self.columns.iter()) {
            raw.insert(key.clone(), value.clone());
        }
        raw.insert(ID_COLUMN.to_string(), Value::String(self.id.clone()));
        raw
    }
}
