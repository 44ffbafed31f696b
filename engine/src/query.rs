//! Minimal declarative queries over a single table.
//!
//! A [`TableQuery`] is a table name plus a conjunction of column
//! [`Condition`]s. Stores may compile it to their native query language;
//! [`TableQuery::matches`] evaluates it against a raw in memory.

use crate::raw::{RawRecord, SyncStatus, ID_COLUMN, STATUS_COLUMN};
use crate::{ColumnName, RecordId, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A comparison of one column against constant values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "camelCase")]
pub enum Condition {
    Eq { column: ColumnName, value: Value },
    NotEq { column: ColumnName, value: Value },
    Gt { column: ColumnName, value: Value },
    Gte { column: ColumnName, value: Value },
    Lt { column: ColumnName, value: Value },
    Lte { column: ColumnName, value: Value },
    OneOf { column: ColumnName, values: Vec<Value> },
    NotIn { column: ColumnName, values: Vec<Value> },
}

impl Condition {
    pub fn eq(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn not_eq(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::NotEq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn gt(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::Gt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn gte(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::Gte {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lt(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::Lt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lte(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        Condition::Lte {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn one_of<V: Into<Value>>(
        column: impl Into<ColumnName>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Condition::OneOf {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<V: Into<Value>>(
        column: impl Into<ColumnName>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Condition::NotIn {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate against a raw. Missing columns compare as null.
    pub fn matches(&self, raw: &RawRecord) -> bool {
        let left = |column: &str| raw.lookup(column).map(|v| v.into_owned()).unwrap_or(Value::Null);
        match self {
            Condition::Eq { column, value } => left(column) == *value,
            Condition::NotEq { column, value } => left(column) != *value,
            Condition::Gt { column, value } => compare(&left(column), value) == Some(Ordering::Greater),
            Condition::Gte { column, value } => matches!(
                compare(&left(column), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::Lt { column, value } => compare(&left(column), value) == Some(Ordering::Less),
            Condition::Lte { column, value } => matches!(
                compare(&left(column), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::OneOf { column, values } => values.contains(&left(column)),
            Condition::NotIn { column, values } => !values.contains(&left(column)),
        }
    }
}

/// Ordering of two values of the same kind; `None` when either is null or
/// the kinds differ.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Query against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableQuery {
    pub table: TableName,
    pub conditions: Vec<Condition>,
}

impl TableQuery {
    /// Every record of `table`, tombstones included.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
        }
    }

    /// Add a condition.
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Exclude locally deleted records.
    pub fn not_deleted(self) -> Self {
        self.and(Condition::not_eq(STATUS_COLUMN, SyncStatus::Deleted.as_str()))
    }

    /// Restrict to records with one of the given statuses.
    pub fn with_status(self, statuses: &[SyncStatus]) -> Self {
        self.and(Condition::one_of(
            STATUS_COLUMN,
            statuses.iter().map(|s| s.as_str()),
        ))
    }

    /// Restrict to the given ids.
    pub fn with_ids<'a>(self, ids: impl IntoIterator<Item = &'a RecordId>) -> Self {
        self.and(Condition::one_of(ID_COLUMN, ids.into_iter().map(String::as_str)))
    }

    pub fn matches(&self, raw: &RawRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(raw))
    }
}
