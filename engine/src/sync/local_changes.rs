//! Capturing local changes for a push, and committing them once accepted.

use super::timestamp::get_last_pulled_at;
use super::types::{LocalChangeSet, MarkStats, TableChanges};
use crate::adapter::{BatchOperation, LocalStore};
use crate::change_tracker::{can_mark_synced, mark_synced};
use crate::database::Database;
use crate::query::TableQuery;
use crate::raw::{RawRecord, SyncStatus};
use crate::{error::Result, RecordId};
use std::collections::BTreeMap;
use tracing::debug;

const PENDING: [SyncStatus; 3] = [SyncStatus::Created, SyncStatus::Updated, SyncStatus::Deleted];

/// Snapshot every record with something to push.
///
/// Not an action: writes may happen while the snapshot is taken and while it
/// is being pushed. [`mark_local_changes_as_synced`] only commits records
/// that did not change since.
pub async fn fetch_local_changes<S: LocalStore>(db: &Database<S>) -> Result<LocalChangeSet> {
    let mut local = LocalChangeSet {
        last_pulled_at: get_last_pulled_at(db).await?,
        ..Default::default()
    };

    for table in db.schema().tables() {
        let raws = db
            .store()
            .query(&TableQuery::new(table.name.as_str()).with_status(&PENDING))
            .await?;

        let mut changes = TableChanges::default();
        let mut affected = Vec::new();
        for raw in raws {
            match raw.status {
                SyncStatus::Created => changes.created.push(raw.to_sync_payload()),
                SyncStatus::Updated => changes.updated.push(raw.to_sync_payload()),
                SyncStatus::Deleted => {
                    changes.deleted.push(raw.id);
                    continue;
                }
                SyncStatus::Synced => continue,
            }
            affected.push(raw);
        }

        if !affected.is_empty() {
            local.affected_records.insert(table.name.clone(), affected);
        }
        local.changes.insert(table.name.clone(), changes);
    }

    debug!(counts = ?local.counts(), "local changes fetched");
    Ok(local)
}

/// Mark pushed records as synced and purge pushed tombstones.
///
/// A record changed after `local` was captured stays pending, as does a
/// tombstone that was replaced by a server record in the meantime.
pub async fn mark_local_changes_as_synced<S: LocalStore>(
    db: &Database<S>,
    local: &LocalChangeSet,
) -> Result<MarkStats> {
    db.action("sync-markLocalChangesAsSynced", |action| async move {
        let mut stats = MarkStats::default();

        for table in db.schema().tables() {
            let pushed: &[RawRecord] = local
                .affected_records
                .get(&table.name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let deleted: &[RecordId] = local
                .changes
                .get(&table.name)
                .map(|c| c.deleted.as_slice())
                .unwrap_or_default();
            if pushed.is_empty() && deleted.is_empty() {
                continue;
            }

            let ids: Vec<RecordId> = pushed
                .iter()
                .map(|raw| raw.id.clone())
                .chain(deleted.iter().cloned())
                .collect();
            let live: BTreeMap<RecordId, RawRecord> = db
                .store()
                .query(&TableQuery::new(table.name.as_str()).with_ids(&ids))
                .await?
                .into_iter()
                .map(|raw| (raw.id.clone(), raw))
                .collect();

            let mut operations = Vec::new();
            for id in deleted {
                if live.get(id).is_some_and(|raw| raw.status == SyncStatus::Deleted) {
                    operations.push(BatchOperation::DestroyPermanently {
                        table: table.name.clone(),
                        id: id.clone(),
                    });
                    stats.purged += 1;
                }
            }
            for snapshot in pushed {
                let Some(current) = live.get(&snapshot.id) else {
                    continue;
                };
                if can_mark_synced(current, snapshot) {
                    let mut raw = current.clone();
                    mark_synced(&mut raw);
                    operations.push(BatchOperation::Update {
                        table: table.name.clone(),
                        raw,
                    });
                    stats.marked_synced += 1;
                } else {
                    debug!(table = %table.name, id = %snapshot.id, "record changed since push, left pending");
                    stats.left_pending += 1;
                }
            }

            db.apply_operations(&action, operations).await?;
        }

        Ok(stats)
    })
    .await
}

/// Whether any record has something to push.
pub async fn has_unsynced_changes<S: LocalStore>(db: &Database<S>) -> Result<bool> {
    for table in db.schema().tables() {
        let query = TableQuery::new(table.name.as_str()).with_status(&PENDING);
        if db.store().count(&query).await? > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}
