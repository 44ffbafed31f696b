//! Wire and report types of the sync protocol.

use crate::raw::{DirtyRaw, RawRecord};
use crate::{RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;

/// Changes of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    #[serde(default)]
    pub created: Vec<DirtyRaw>,
    #[serde(default)]
    pub updated: Vec<DirtyRaw>,
    #[serde(default)]
    pub deleted: Vec<RecordId>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Changes of a whole database, by table.
pub type SyncDatabaseChangeSet = BTreeMap<TableName, TableChanges>;

/// Response of the server to a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPullResult {
    pub changes: SyncDatabaseChangeSet,
    /// Server time of the pull, the next `lastPulledAt`
    pub timestamp: Timestamp,
}

/// Request of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPushArgs {
    pub changes: SyncDatabaseChangeSet,
    /// Timestamp of the pull that preceded this push
    pub last_pulled_at: Timestamp,
}

/// Local changes captured for a push.
///
/// Never modified after capture: marking records as synced compares the
/// live records against it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalChangeSet {
    /// Changes as sent to the server
    pub changes: SyncDatabaseChangeSet,
    /// Created and updated raws with their sync metadata, by table
    pub affected_records: BTreeMap<TableName, Vec<RawRecord>>,
    /// Last pulled at when the changes were captured
    pub last_pulled_at: Option<Timestamp>,
}

impl LocalChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(TableChanges::is_empty)
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts::of(&self.changes)
    }
}

/// Number of created, updated and deleted records in a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ChangeCounts {
    pub fn of(changes: &SyncDatabaseChangeSet) -> Self {
        changes.values().fold(Self::default(), |acc, t| Self {
            created: acc.created + t.created.len(),
            updated: acc.updated + t.updated.len(),
            deleted: acc.deleted + t.deleted.len(),
        })
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// What applying remote changes did locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStats {
    /// Records inserted
    pub created: usize,
    /// Synced records replaced by the server version
    pub updated: usize,
    /// Local tombstones replaced by a server record
    pub resurrected: usize,
    /// Locally modified records merged with the server version
    pub conflicts: usize,
    /// Records removed
    pub destroyed: usize,
    /// Changes with no local effect
    pub ignored: usize,
}

impl AddAssign for ApplyStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.resurrected += other.resurrected;
        self.conflicts += other.conflicts;
        self.destroyed += other.destroyed;
        self.ignored += other.ignored;
    }
}

/// What marking pushed changes as synced did locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkStats {
    pub marked_synced: usize,
    /// Records modified after the push snapshot, still to be pushed
    pub left_pending: usize,
    /// Tombstones removed
    pub purged: usize,
}

impl AddAssign for MarkStats {
    fn add_assign(&mut self, other: Self) {
        self.marked_synced += other.marked_synced;
        self.left_pending += other.left_pending;
        self.purged += other.purged;
    }
}

/// Outcome of a successful synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub last_pulled_at: Timestamp,
    pub pulled: ChangeCounts,
    pub applied: ApplyStats,
    pub pushed: ChangeCounts,
    pub marked: MarkStats,
}
