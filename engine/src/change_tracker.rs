//! Change tracking rules.
//!
//! Every raw carries a [`SyncStatus`] and a [`ChangedColumns`] set. Together
//! they tell sync, without any separate log, what was changed locally since
//! the last successful push. This module holds the pure transition rules; it
//! performs no I/O.

use crate::raw::{ChangedColumns, RawRecord, SyncStatus};
use crate::{error::Result, Error, TableName};

/// Compute the state after a local write touching `written` columns.
///
/// - `created` stays `created`, the whole record is new anyway
/// - `synced` and `updated` become `updated`, accumulating columns
/// - `deleted` records must not be written to
pub fn next_state<'a>(
    status: SyncStatus,
    changed: &ChangedColumns,
    written: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<(SyncStatus, ChangedColumns), SyncStatus> {
    let mut written = written.into_iter().peekable();
    let nothing_written = written.peek().is_none();
    match status {
        SyncStatus::Deleted => Err(status),
        _ if nothing_written => Ok((status, changed.clone())),
        SyncStatus::Created => Ok((SyncStatus::Created, changed.clone())),
        SyncStatus::Synced | SyncStatus::Updated => {
            let mut next = changed.clone();
            next.extend(written);
            Ok((SyncStatus::Updated, next))
        }
    }
}

/// Apply [`next_state`] to a raw in place.
pub fn track_write<'a>(
    table: &str,
    raw: &mut RawRecord,
    written: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let (status, changed) =
        next_state(raw.status, &raw.changed, written).map_err(|_| Error::ModifyDeleted {
            table: TableName::from(table),
            id: raw.id.clone(),
        })?;
    raw.status = status;
    raw.changed = changed;
    Ok(())
}

/// Reset to `(synced, ∅)`.
///
/// Unconditional: callers check [`can_mark_synced`] first.
pub fn mark_synced(raw: &mut RawRecord) {
    raw.status = SyncStatus::Synced;
    raw.changed.clear();
}

/// Tombstone a record locally.
pub fn mark_deleted(raw: &mut RawRecord) {
    raw.status = SyncStatus::Deleted;
}

/// Whether the live version of a record may be marked synced after `pushed`
/// was accepted by the server.
///
/// A column changed after the snapshot was taken must stay pending, so the
/// live changed set has to be covered by the pushed one and the values must
/// still be the ones that were pushed.
pub fn can_mark_synced(live: &RawRecord, pushed: &RawRecord) -> bool {
    matches!(live.status, SyncStatus::Created | SyncStatus::Updated)
        && live.changed.is_subset(&pushed.changed)
        && live.content_eq(pushed)
}
