//! Applying pulled changes to the local database.
//!
//! Every record named by the server is first loaded, the table's changes are
//! folded into a working copy, and the difference is written in one batch
//! per table. Applying the same change set twice yields the same state.

use super::types::{ApplyStats, SyncDatabaseChangeSet, TableChanges};
use crate::action_queue::Action;
use crate::adapter::{BatchOperation, LocalStore};
use crate::conflict::resolve_conflict;
use crate::database::Database;
use crate::query::TableQuery;
use crate::raw::{DirtyRaw, RawRecord, SyncStatus, CHANGED_COLUMN, STATUS_COLUMN};
use crate::schema::TableSchema;
use crate::{error::Result, RecordId, TableName};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// A pulled raw, sanitized, next to the keys the server actually sent.
struct RemoteRaw<'a> {
    sanitized: RawRecord,
    sent: &'a DirtyRaw,
}

/// A table's pulled changes, validated.
struct PreparedTable<'a> {
    schema: &'a TableSchema,
    created: Vec<RemoteRaw<'a>>,
    updated: Vec<RemoteRaw<'a>>,
    deleted: &'a [RecordId],
}

/// Apply `changes` inside `action`.
///
/// Tables are processed in schema declaration order. Every table and raw is
/// validated before anything is written: an unknown table or a raw without
/// a valid id fails the whole apply.
pub async fn apply_remote_changes<S: LocalStore>(
    db: &Database<S>,
    action: &Action,
    changes: &SyncDatabaseChangeSet,
    send_created_as_updated: bool,
) -> Result<ApplyStats> {
    db.queue().ensure_in_action(
        action,
        "apply_remote_changes() can only be called from inside of an action",
    )?;

    let schema = db.schema();
    for table in changes.keys() {
        schema.require_table(table)?;
    }

    let mut prepared = Vec::new();
    for table in schema.tables() {
        if let Some(table_changes) = changes.get(&table.name) {
            prepared.push(prepare_table(table, table_changes)?);
        }
    }

    let mut stats = ApplyStats::default();
    for table in prepared {
        stats += apply_table(db, action, table, send_created_as_updated).await?;
    }
    debug!(?stats, "remote changes applied");
    Ok(stats)
}

fn prepare_table<'a>(schema: &'a TableSchema, changes: &'a TableChanges) -> Result<PreparedTable<'a>> {
    let sanitize = |raws: &'a [DirtyRaw]| {
        raws.iter()
            .map(|sent| -> Result<RemoteRaw<'a>> {
                Ok(RemoteRaw {
                    sanitized: schema.sanitize_remote(sent)?,
                    sent,
                })
            })
            .collect::<Result<Vec<_>>>()
    };
    Ok(PreparedTable {
        schema,
        created: sanitize(&changes.created)?,
        updated: sanitize(&changes.updated)?,
        deleted: &changes.deleted,
    })
}

async fn apply_table<S: LocalStore>(
    db: &Database<S>,
    action: &Action,
    table: PreparedTable<'_>,
    send_created_as_updated: bool,
) -> Result<ApplyStats> {
    let schema = table.schema;
    let name: &TableName = &schema.name;
    let ids: Vec<RecordId> = table
        .created
        .iter()
        .chain(&table.updated)
        .map(|remote| remote.sanitized.id.clone())
        .chain(table.deleted.iter().cloned())
        .collect();
    if ids.is_empty() {
        return Ok(ApplyStats::default());
    }

    let original: BTreeMap<RecordId, RawRecord> = db
        .store()
        .query(&TableQuery::new(name.as_str()).with_ids(&ids))
        .await?
        .into_iter()
        .map(|raw| (raw.id.clone(), raw))
        .collect();
    let mut working: BTreeMap<RecordId, Option<RawRecord>> = original
        .iter()
        .map(|(id, raw)| (id.clone(), Some(raw.clone())))
        .collect();
    let mut stats = ApplyStats::default();

    for remote in table.created {
        let id = remote.sanitized.id.clone();
        match working.get(&id).cloned().flatten() {
            None => {
                stats.created += 1;
                working.insert(id, Some(remote.sanitized));
            }
            Some(local) if local.status == SyncStatus::Deleted => {
                error!(table = %name, %id, "remote created a locally deleted record, resurrecting");
                stats.resurrected += 1;
                working.insert(id, Some(remote.sanitized));
            }
            Some(local) => {
                error!(table = %name, %id, "remote created an existing record, treating as update");
                let merged = merge(schema, local, remote.sent, &mut stats)?;
                working.insert(id, Some(merged));
            }
        }
    }

    for remote in table.updated {
        let id = remote.sanitized.id.clone();
        match working.get(&id).cloned().flatten() {
            None => {
                if !send_created_as_updated {
                    warn!(table = %name, %id, "remote updated a record missing locally, creating it");
                }
                stats.created += 1;
                working.insert(id, Some(remote.sanitized));
            }
            Some(local) if local.status == SyncStatus::Deleted => {
                // The local deletion is pushed next.
                stats.ignored += 1;
            }
            Some(local) => {
                let merged = merge(schema, local, remote.sent, &mut stats)?;
                working.insert(id, Some(merged));
            }
        }
    }

    for id in table.deleted {
        match working.get(id).cloned().flatten() {
            None => stats.ignored += 1,
            Some(local) if local.status == SyncStatus::Deleted => stats.ignored += 1,
            Some(_) => {
                stats.destroyed += 1;
                working.insert(id.clone(), None);
            }
        }
    }

    let operations = working
        .into_iter()
        .filter_map(|(id, next)| match (original.get(&id), next) {
            (Some(before), Some(raw)) if *before == raw => None,
            (Some(_), Some(raw)) => Some(BatchOperation::Update {
                table: name.clone(),
                raw,
            }),
            (None, Some(raw)) => Some(BatchOperation::Create {
                table: name.clone(),
                raw,
            }),
            (Some(_), None) => Some(BatchOperation::DestroyPermanently {
                table: name.clone(),
                id,
            }),
            (None, None) => None,
        })
        .collect::<Vec<_>>();

    debug!(table = %name, operations = operations.len(), "writing remote changes");
    db.apply_operations(action, operations).await?;
    Ok(stats)
}

/// Server version of a record that exists locally and is not deleted.
///
/// Only the keys the server sent replace local values; the result is
/// sanitized afterwards, so a column the server left out keeps its local
/// value instead of falling back to its default.
fn merge(
    schema: &TableSchema,
    local: RawRecord,
    sent: &DirtyRaw,
    stats: &mut ApplyStats,
) -> Result<RawRecord> {
    let mut overlaid = local.to_sync_payload();
    overlaid.extend(
        sent.iter()
            .filter(|(key, _)| !matches!(key.as_str(), STATUS_COLUMN | CHANGED_COLUMN))
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    let remote = schema.sanitize_remote(&overlaid)?;

    if local.status == SyncStatus::Synced {
        stats.updated += 1;
        Ok(remote)
    } else {
        stats.conflicts += 1;
        Ok(resolve_conflict(&local, &remote))
    }
}
