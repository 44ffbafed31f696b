//! In-memory server replica speaking the pull/push protocol.
//!
//! Every accepted push advances the server clock by one and stamps the
//! records it wrote. A pull returns everything stamped after the client's
//! `lastPulledAt` together with the current clock. A push is rejected as a
//! whole when any of its records was modified on the server after the
//! client's `lastPulledAt`, so the client has to pull and resolve first.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tandem_engine::error::Result;
use tandem_engine::{
    DirtyRaw, Error, RecordId, SyncDatabaseChangeSet, SyncPullResult, SyncPushArgs, SyncRemote,
    TableChanges, TableName, Timestamp,
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct ServerRecord {
    payload: DirtyRaw,
    created_at: Timestamp,
    modified_at: Timestamp,
    deleted: bool,
}

/// One record write of an accepted push; `None` deletes.
struct StagedWrite {
    table: TableName,
    id: RecordId,
    payload: Option<DirtyRaw>,
}

/// Request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStats {
    pub pulls: usize,
    pub pushes_accepted: usize,
    pub pushes_rejected: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    clock: Timestamp,
    tables: BTreeMap<TableName, BTreeMap<RecordId, ServerRecord>>,
    stats: RemoteStats,
}

#[derive(Debug)]
pub struct InMemoryRemote {
    latency: Duration,
    send_created_as_updated: bool,
    state: Mutex<ServerState>,
}

impl InMemoryRemote {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            send_created_as_updated: false,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Report records created since the last pull in the `updated` list.
    pub fn with_send_created_as_updated(mut self, enabled: bool) -> Self {
        self.send_created_as_updated = enabled;
        self
    }

    pub fn clock(&self) -> Timestamp {
        self.state.lock().clock
    }

    pub fn stats(&self) -> RemoteStats {
        self.state.lock().stats
    }

    /// Payloads of every record not deleted on the server.
    pub fn live_records(&self) -> BTreeMap<TableName, BTreeMap<RecordId, DirtyRaw>> {
        self.state
            .lock()
            .tables
            .iter()
            .map(|(table, records)| {
                let live = records
                    .iter()
                    .filter(|(_, record)| !record.deleted)
                    .map(|(id, record)| (id.clone(), record.payload.clone()))
                    .collect();
                (table.clone(), live)
            })
            .collect()
    }

    async fn transport_delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl SyncRemote for InMemoryRemote {
    async fn pull_changes(&self, last_pulled_at: Option<Timestamp>) -> Result<SyncPullResult> {
        self.transport_delay().await;

        let mut state = self.state.lock();
        state.stats.pulls += 1;

        let mut changes = SyncDatabaseChangeSet::new();
        for (table, records) in &state.tables {
            let mut table_changes = TableChanges::default();
            for (id, record) in records {
                match last_pulled_at {
                    Some(since) if record.modified_at <= since => continue,
                    // a first pull has nothing to delete
                    None if record.deleted => continue,
                    _ => {}
                }
                let is_new = last_pulled_at.map_or(true, |since| record.created_at > since);
                if record.deleted {
                    table_changes.deleted.push(id.clone());
                } else if is_new && !self.send_created_as_updated {
                    table_changes.created.push(record.payload.clone());
                } else {
                    table_changes.updated.push(record.payload.clone());
                }
            }
            if !table_changes.is_empty() {
                changes.insert(table.clone(), table_changes);
            }
        }

        debug!(
            ?last_pulled_at,
            timestamp = state.clock,
            tables = changes.len(),
            "served pull"
        );
        Ok(SyncPullResult {
            changes,
            timestamp: state.clock,
        })
    }

    async fn push_changes(&self, args: SyncPushArgs) -> Result<()> {
        self.transport_delay().await;

        let mut state = self.state.lock();
        let staged = match stage(&state, args) {
            Ok(staged) => staged,
            Err(e) => {
                state.stats.pushes_rejected += 1;
                warn!(error = %e, "push rejected");
                return Err(e);
            }
        };
        state.stats.pushes_accepted += 1;
        if staged.is_empty() {
            return Ok(());
        }

        state.clock += 1;
        let now = state.clock;
        let writes = staged.len();
        for write in staged {
            let records = state.tables.entry(write.table).or_default();
            let Some(payload) = write.payload else {
                // a record that never reached the server has nothing to delete
                if let Some(record) = records.get_mut(&write.id) {
                    record.deleted = true;
                    record.modified_at = now;
                }
                continue;
            };
            match records.get_mut(&write.id) {
                Some(record) => {
                    if record.deleted {
                        record.created_at = now;
                        record.deleted = false;
                    }
                    record.payload = payload;
                    record.modified_at = now;
                }
                None => {
                    records.insert(
                        write.id,
                        ServerRecord {
                            payload,
                            created_at: now,
                            modified_at: now,
                            deleted: false,
                        },
                    );
                }
            }
        }

        debug!(clock = now, writes, "accepted push");
        Ok(())
    }
}

/// Check a push against the server state without writing anything.
fn stage(state: &ServerState, args: SyncPushArgs) -> Result<Vec<StagedWrite>> {
    let since = args.last_pulled_at;
    let mut staged = Vec::new();

    for (table, changes) in args.changes {
        let mut writes = Vec::new();
        for payload in changes.created.into_iter().chain(changes.updated) {
            writes.push((payload_id(&table, &payload)?, Some(payload)));
        }
        writes.extend(changes.deleted.into_iter().map(|id| (id, None)));

        let existing = state.tables.get(&table);
        for (id, payload) in writes {
            if let Some(record) = existing.and_then(|records| records.get(&id)) {
                if record.modified_at > since {
                    return Err(Error::Remote(format!(
                        "{table}#{id} was modified on the server at {} after lastPulledAt {since}",
                        record.modified_at
                    )));
                }
            }
            staged.push(StagedWrite {
                table: table.clone(),
                id,
                payload,
            });
        }
    }

    Ok(staged)
}

fn payload_id(table: &str, payload: &DirtyRaw) -> Result<RecordId> {
    match payload.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(Error::Remote(format!("pushed {table} record without an id"))),
    }
}
