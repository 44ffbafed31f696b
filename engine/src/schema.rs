//! Schema definition, validation and raw sanitization.
//!
//! Schemas declare the tables of a database and the typed columns of each
//! table. Local writes are validated strictly against the schema; raws coming
//! from outside (remote change sets, persisted snapshots) are sanitized
//! leniently so that a malformed value can never poison the local store.

use crate::raw::{ChangedColumns, DirtyRaw, RawRecord, SyncStatus};
use crate::raw::{CHANGED_COLUMN, ID_COLUMN, STATUS_COLUMN};
use crate::{error::Result, ColumnName, Error, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "string"),
            ColumnType::Number => write!(f, "number"),
            ColumnType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: ColumnName,
    pub column_type: ColumnType,
    /// Whether the column accepts null
    pub is_optional: bool,
}

impl ColumnSchema {
    /// A non-null column.
    pub fn required(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_optional: false,
        }
    }

    /// A nullable column.
    pub fn optional(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_optional: true,
        }
    }

    /// Validate a value written by local code.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let valid = match value {
            Value::Null => self.is_optional,
            v => self.has_type(v),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    /// Coerce an arbitrary value into one this column can hold.
    ///
    /// Wrongly typed or missing values become null for optional columns and
    /// the type's zero value otherwise.
    pub fn sanitize(&self, value: Option<&Value>) -> Value {
        match value {
            Some(v) if !v.is_null() && self.has_type(v) => v.clone(),
            _ => self.default_value(),
        }
    }

    /// Value a freshly created record holds in this column.
    pub fn default_value(&self) -> Value {
        if self.is_optional {
            return Value::Null;
        }
        match self.column_type {
            ColumnType::String => Value::String(String::new()),
            ColumnType::Number => Value::from(0),
            ColumnType::Boolean => Value::Bool(false),
        }
    }

    fn has_type(&self, value: &Value) -> bool {
        match self.column_type {
            ColumnType::String => value.is_string(),
            ColumnType::Number => value.is_number(),
            ColumnType::Boolean => value.is_boolean(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: TableName,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<TableName>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Raw for a new local record: every column at its default value.
    pub fn blank_raw(&self, id: impl Into<String>) -> RawRecord {
        let mut raw = RawRecord::new(id);
        raw.columns = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.default_value()))
            .collect();
        raw
    }

    /// Turn an untrusted raw into a well-formed [`RawRecord`].
    ///
    /// The id must be a non-empty string. An unknown `_status` falls back to
    /// `created`, a missing `_changed` to the empty set. Keys the schema does
    /// not declare are kept in [`RawRecord::extra`].
    pub fn sanitize(&self, dirty: &DirtyRaw) -> Result<RawRecord> {
        let id = match dirty.get(ID_COLUMN) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            other => {
                return Err(Error::InvalidRecordId(format!(
                    "{}: {}",
                    self.name,
                    other.map(Value::to_string).unwrap_or_else(|| "missing".into())
                )))
            }
        };

        let status = dirty
            .get(STATUS_COLUMN)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<SyncStatus>().ok())
            .unwrap_or(SyncStatus::Created);

        let changed = dirty
            .get(CHANGED_COLUMN)
            .and_then(Value::as_str)
            .map(|s| s.parse::<ChangedColumns>().unwrap_or_default())
            .unwrap_or_default();

        let columns: BTreeMap<_, _> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.sanitize(dirty.get(&c.name))))
            .collect();

        let extra = dirty
            .iter()
            .filter(|(key, _)| {
                !matches!(key.as_str(), ID_COLUMN | STATUS_COLUMN | CHANGED_COLUMN)
                    && !columns.contains_key(key.as_str())
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(RawRecord {
            id,
            status,
            changed,
            columns,
            extra,
        })
    }

    /// Sanitize a raw received from the server: status forced to `synced`.
    pub fn sanitize_remote(&self, dirty: &DirtyRaw) -> Result<RawRecord> {
        let mut raw = self.sanitize(dirty)?;
        raw.status = SyncStatus::Synced;
        raw.changed.clear();
        Ok(raw)
    }
}

/// Schema for the entire database.
///
/// Tables keep their declaration order, which is also the order in which
/// remote changes are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSchema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    tables: Vec<TableSchema>,
}

impl AppSchema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: Vec::new(),
        }
    }

    /// Add a table, replacing an existing table of the same name in place.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Like [`AppSchema::table`], failing with [`Error::TableNotFound`].
    pub fn require_table(&self, name: &str) -> Result<&TableSchema> {
        self.table(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Tables in declaration order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.iter()
    }
}
