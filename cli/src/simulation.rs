//! Multi-replica convergence run.
//!
//! Every client owns a `Database<MemoryStore>` and a `Synchronizer` against
//! the shared [`InMemoryRemote`]. Rounds run all clients at once, each one
//! editing records while its own sync is in flight. A settle phase then
//! syncs client after client until the server clock stops moving and
//! nothing is left to push, and the replicas are compared to the server.

use crate::config::Config;
use crate::error::{CliError, Result};
use crate::remote::{InMemoryRemote, RemoteStats};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;
use std::path::Path;
use std::sync::Arc;
use tandem_engine::{
    has_unsynced_changes, AppSchema, ColumnSchema, ColumnType, Condition, Database, DirtyRaw,
    Error as EngineError, LocalStore, MemoryStore, Record, RecordId, SyncOptions, SyncReport, SyncStatus,
    Synchronizer, TableName, TableQuery, TableSchema,
};
use tracing::{debug, info, warn};

pub fn app_schema() -> AppSchema {
    AppSchema::new(1)
        .with_table(TableSchema::new(
            "projects",
            vec![ColumnSchema::required("name", ColumnType::String)],
        ))
        .with_table(TableSchema::new(
            "tasks",
            vec![
                ColumnSchema::required("name", ColumnType::String),
                ColumnSchema::optional("position", ColumnType::Number),
                ColumnSchema::required("is_done", ColumnType::Boolean),
            ],
        ))
}

/// Local writes performed by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditTally {
    pub applied: usize,
    /// Edits of records a concurrent pull destroyed first
    pub skipped: usize,
}

impl EditTally {
    fn record(&mut self, result: std::result::Result<(), EngineError>) -> Result<()> {
        match result {
            Ok(()) => self.applied += 1,
            Err(EngineError::RecordNotFound { table, id }) => {
                debug!(%table, %id, "edited record was destroyed by a pull");
                self.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

impl AddAssign for EditTally {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.skipped += other.skipped;
    }
}

/// Sync outcomes across all clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTally {
    pub succeeded: usize,
    /// Retryable failures: rejected pushes and concurrent syncs
    pub failed: usize,
    pub conflicts: usize,
    pub left_pending: usize,
}

impl SyncTally {
    fn record(
        &mut self,
        client: usize,
        result: std::result::Result<SyncReport, EngineError>,
    ) -> Result<()> {
        match result {
            Ok(report) => {
                self.succeeded += 1;
                self.conflicts += report.applied.conflicts;
                self.left_pending += report.marked.left_pending;
            }
            Err(e) if e.is_retryable() => {
                debug!(client, error = %e, "sync failed, will retry");
                self.failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// A record on which a client disagrees with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub client: usize,
    pub table: TableName,
    pub id: RecordId,
    pub reason: String,
}

/// Outcome of a run, printed as JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub clients: usize,
    pub rounds: usize,
    pub server_clock: u64,
    pub server_records: BTreeMap<TableName, usize>,
    pub edits: EditTally,
    pub syncs: SyncTally,
    pub settle_passes: usize,
    pub remote: RemoteStats,
    pub divergences: Vec<Divergence>,
    pub converged: bool,
}

struct Client {
    index: usize,
    db: Database<MemoryStore>,
    sync: Synchronizer<MemoryStore, InMemoryRemote>,
}

impl Client {
    fn new(index: usize, remote: Arc<InMemoryRemote>, options: SyncOptions) -> Self {
        let db = Database::new(MemoryStore::new(app_schema()));
        let sync = Synchronizer::with_options(db.clone(), remote, options);
        Self { index, db, sync }
    }

    async fn seed(&self, records: usize) -> Result<()> {
        let index = self.index;
        let db = &self.db;
        db.action("seed", |action| async move {
            let projects = db.collection("projects")?;
            let tasks = db.collection("tasks")?;

            let mut prepared = vec![projects.prepare_create(|d| {
                d.set("name", json!(format!("project of client {index}")))
            })?];
            for i in 0..records {
                prepared.push(tasks.prepare_create(|d| {
                    d.set("name", json!(format!("c{index} task {i}")))?;
                    d.set("position", json!(i))
                })?);
            }
            db.batch(&action, prepared).await
        })
        .await?;
        Ok(())
    }

    /// Rename one task, toggle another, delete a third every other round and
    /// create a new one. Targets depend only on the round and client index.
    async fn edit(&self, round: usize) -> Result<EditTally> {
        let db = &self.db;
        let mut tally = EditTally::default();

        let mut live: Vec<Record> = db
            .collection("tasks")?
            .query(Vec::<Condition>::new())
            .await?;
        live.sort_by(|a, b| a.id().cmp(b.id()));

        if !live.is_empty() {
            let offset = round * 7 + self.index * 3;
            let renamed = live[offset % live.len()].clone();
            let toggled = live[(offset + 1) % live.len()].clone();
            let name = json!(format!("c{} round {round}", self.index));
            let done = !toggled
                .get("is_done")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            tally.record(
                db.action("rename", |action| async move {
                    db.update(&action, &renamed, |d| d.set("name", name)).await
                })
                .await,
            )?;
            tally.record(
                db.action("toggle", |action| async move {
                    db.update(&action, &toggled, |d| d.set("is_done", json!(done)))
                        .await
                })
                .await,
            )?;

            if round % 2 == 1 && live.len() > 2 {
                let doomed = live[(offset + 2) % live.len()].clone();
                tally.record(
                    db.action("delete", |action| async move {
                        db.mark_as_deleted(&action, &doomed).await
                    })
                    .await,
                )?;
            }
        }

        let index = self.index;
        tally.record(
            db.action("create", |action| async move {
                db.create(&action, "tasks", |d| {
                    d.set("name", json!(format!("c{index} new in round {round}")))?;
                    d.set("position", json!(round))
                })
                .await
                .map(|_| ())
            })
            .await,
        )?;

        Ok(tally)
    }

    /// Records this client disagrees with the server on.
    async fn diverging(
        &self,
        server: &BTreeMap<TableName, BTreeMap<RecordId, DirtyRaw>>,
    ) -> Result<Vec<Divergence>> {
        let mut divergences = Vec::new();
        let empty = BTreeMap::new();

        for table in self.db.schema().tables() {
            let expected = server.get(&table.name).unwrap_or(&empty);
            let local = self
                .db
                .store()
                .query(&TableQuery::new(table.name.as_str()))
                .await?;

            let mut diverge = |id: &RecordId, reason: String| {
                divergences.push(Divergence {
                    client: self.index,
                    table: table.name.clone(),
                    id: id.clone(),
                    reason,
                })
            };

            let mut seen = BTreeSet::new();
            for raw in &local {
                seen.insert(raw.id.clone());
                if raw.status != SyncStatus::Synced {
                    diverge(&raw.id, format!("still {}", raw.status));
                    continue;
                }
                match expected.get(&raw.id) {
                    None => diverge(&raw.id, "missing on server".into()),
                    Some(payload) if *payload != raw.to_sync_payload() => {
                        diverge(&raw.id, "content differs from server".into())
                    }
                    Some(_) => {}
                }
            }
            for id in expected.keys().filter(|id| !seen.contains(*id)) {
                diverge(id, "missing on client".into());
            }
        }

        Ok(divergences)
    }
}

/// Run the whole simulation described by `config`.
pub async fn run(config: &Config) -> Result<Summary> {
    let remote = Arc::new(
        InMemoryRemote::new(config.remote_latency)
            .with_send_created_as_updated(config.send_created_as_updated),
    );
    let options = SyncOptions {
        send_created_as_updated: config.send_created_as_updated,
    };
    let clients: Vec<Client> = (0..config.clients)
        .map(|index| Client::new(index, remote.clone(), options))
        .collect();

    for client in &clients {
        client.seed(config.records).await?;
    }
    info!(
        clients = clients.len(),
        records = config.records,
        "clients seeded"
    );

    let mut edits = EditTally::default();
    let mut syncs = SyncTally::default();

    for round in 0..config.rounds {
        let outcomes = join_all(clients.iter().map(|client| async move {
            let (edited, synced) = tokio::join!(client.edit(round), client.sync.synchronize());
            (client.index, edited, synced)
        }))
        .await;

        for (index, edited, synced) in outcomes {
            edits += edited?;
            syncs.record(index, synced)?;
        }
        info!(round, server_clock = remote.clock(), "round finished");
    }

    let settle_passes = settle(&clients, &remote, &mut syncs).await?;

    let server = remote.live_records();
    let mut divergences = Vec::new();
    for client in &clients {
        divergences.extend(client.diverging(&server).await?);
    }
    for divergence in &divergences {
        warn!(
            client = divergence.client,
            table = %divergence.table,
            id = %divergence.id,
            reason = %divergence.reason,
            "replica diverged"
        );
    }

    if let Some(dir) = &config.snapshot_dir {
        write_snapshots(dir, &clients).await?;
    }

    let summary = Summary {
        clients: clients.len(),
        rounds: config.rounds,
        server_clock: remote.clock(),
        server_records: server
            .iter()
            .map(|(table, records)| (table.clone(), records.len()))
            .collect(),
        edits,
        syncs,
        settle_passes,
        remote: remote.stats(),
        converged: divergences.is_empty(),
        divergences,
    };
    info!(
        converged = summary.converged,
        server_clock = summary.server_clock,
        conflicts = summary.syncs.conflicts,
        rejected_pushes = summary.remote.pushes_rejected,
        "simulation finished"
    );
    Ok(summary)
}

/// Sync clients one after another until a full pass neither moved the
/// server clock nor left anything to push.
async fn settle(
    clients: &[Client],
    remote: &InMemoryRemote,
    syncs: &mut SyncTally,
) -> Result<usize> {
    let max_passes = clients.len() * 4 + 8;

    for pass in 1..=max_passes {
        let clock_before = remote.clock();
        for client in clients {
            syncs.record(client.index, client.sync.synchronize().await)?;
        }

        let mut pending = false;
        for client in clients {
            pending |= has_unsynced_changes(&client.db).await?;
        }
        debug!(pass, pending, clock = remote.clock(), "settle pass");
        if !pending && remote.clock() == clock_before {
            return Ok(pass);
        }
    }

    Err(CliError::NotSettled(max_passes))
}

async fn write_snapshots(dir: &Path, clients: &[Client]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for client in clients {
        let json = client.db.store().export_snapshot().to_json_pretty()?;
        let path = dir.join(format!("client-{}.json", client.index));
        tokio::fs::write(&path, json).await?;
        info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}
