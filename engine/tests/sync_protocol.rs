//! Protocol tests for tandem-engine
//!
//! Each test drives a database through a full or partial sync against a
//! scripted remote and checks one guarantee of the protocol.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_engine::sync::{apply_remote_changes, get_last_pulled_at};
use tandem_engine::{
    has_unsynced_changes, AppSchema, BatchOperation, ColumnSchema, ColumnType, Database,
    DirtyRaw, Error, LocalStore, MemoryStore, RawRecord, Record, SyncDatabaseChangeSet,
    SyncPullResult, SyncPushArgs, SyncRemote, SyncStatus, Synchronizer, TableChanges, TableQuery,
    TableSchema, Timestamp,
};
use tokio::sync::Notify;

// ============================================================================
// Fixtures
// ============================================================================

/// Tables are declared tasks first, so schema order differs from name order.
fn test_schema() -> AppSchema {
    AppSchema::new(1)
        .with_table(TableSchema::new(
            "tasks",
            vec![
                ColumnSchema::required("name", ColumnType::String),
                ColumnSchema::optional("position", ColumnType::Number),
            ],
        ))
        .with_table(TableSchema::new(
            "projects",
            vec![ColumnSchema::required("name", ColumnType::String)],
        ))
}

fn dirty(value: Value) -> DirtyRaw {
    value.as_object().cloned().unwrap()
}

fn task_changes(tc: TableChanges) -> SyncDatabaseChangeSet {
    SyncDatabaseChangeSet::from([("tasks".to_string(), tc)])
}

fn pull(changes: SyncDatabaseChangeSet, timestamp: Timestamp) -> SyncPullResult {
    SyncPullResult { changes, timestamp }
}

/// Store wrapper logging the first record id of each batch, with a yield
/// inside the batch so that unserialized writers would interleave.
struct RecordingStore {
    inner: MemoryStore,
    log: Mutex<Vec<String>>,
    failing_batches: AtomicUsize,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(test_schema()),
            log: Mutex::new(Vec::new()),
            failing_batches: AtomicUsize::new(0),
        }
    }

    fn fail_next_batches(&self, count: usize) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl LocalStore for RecordingStore {
    fn schema(&self) -> &AppSchema {
        self.inner.schema()
    }

    async fn find(&self, table: &str, id: &str) -> tandem_engine::error::Result<Option<RawRecord>> {
        self.inner.find(table, id).await
    }

    async fn query(&self, query: &TableQuery) -> tandem_engine::error::Result<Vec<RawRecord>> {
        self.inner.query(query).await
    }

    async fn count(&self, query: &TableQuery) -> tandem_engine::error::Result<usize> {
        self.inner.count(query).await
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> tandem_engine::error::Result<()> {
        let first = operations
            .first()
            .map(|op| op.id().to_string())
            .unwrap_or_default();
        self.log.lock().push(format!("begin {first}"));
        tokio::task::yield_now().await;

        let failing = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if failing {
            Err(Error::Storage("disk full".into()))
        } else {
            self.inner.batch(operations).await
        };

        self.log.lock().push(format!("end {first}"));
        result
    }

    async fn get_local(&self, key: &str) -> tandem_engine::error::Result<Option<String>> {
        self.inner.get_local(key).await
    }

    async fn set_local(&self, key: &str, value: String) -> tandem_engine::error::Result<()> {
        self.inner.set_local(key, value).await
    }

    async fn unsafe_reset_database(&self) -> tandem_engine::error::Result<()> {
        self.inner.unsafe_reset_database().await
    }
}

/// Remote serving queued pulls and recording pushes.
#[derive(Default)]
struct ScriptedRemote {
    pulls: Mutex<VecDeque<SyncPullResult>>,
    /// `lastPulledAt` of every pull request
    pulled_since: Mutex<Vec<Option<Timestamp>>>,
    pushes: Mutex<Vec<SyncPushArgs>>,
    /// Pull waits for this before answering
    pull_gate: Option<Arc<Notify>>,
    /// Push signals the first, then waits for the second
    push_gate: Option<(Arc<Notify>, Arc<Notify>)>,
    fail_next_push: AtomicBool,
}

impl ScriptedRemote {
    fn serving(pulls: impl IntoIterator<Item = SyncPullResult>) -> Self {
        Self {
            pulls: Mutex::new(pulls.into_iter().collect()),
            ..Default::default()
        }
    }

    fn pushes(&self) -> Vec<SyncPushArgs> {
        self.pushes.lock().clone()
    }

    fn pulled_since(&self) -> Vec<Option<Timestamp>> {
        self.pulled_since.lock().clone()
    }
}

impl SyncRemote for ScriptedRemote {
    async fn pull_changes(
        &self,
        last_pulled_at: Option<Timestamp>,
    ) -> tandem_engine::error::Result<SyncPullResult> {
        if let Some(gate) = &self.pull_gate {
            gate.notified().await;
        }
        self.pulled_since.lock().push(last_pulled_at);
        let next = self.pulls.lock().pop_front();
        Ok(next.unwrap_or_else(|| {
            pull(SyncDatabaseChangeSet::new(), last_pulled_at.unwrap_or(0) + 1)
        }))
    }

    async fn push_changes(&self, args: SyncPushArgs) -> tandem_engine::error::Result<()> {
        if let Some((started, resume)) = &self.push_gate {
            started.notify_one();
            resume.notified().await;
        }
        if self.fail_next_push.swap(false, Ordering::SeqCst) {
            return Err(Error::Remote("push rejected".into()));
        }
        self.pushes.lock().push(args);
        Ok(())
    }
}

fn memory_db() -> Database<MemoryStore> {
    Database::new(MemoryStore::new(test_schema()))
}

/// Apply a pull without a remote, as the first sync would.
async fn pull_into<S: LocalStore>(db: &Database<S>, changes: SyncDatabaseChangeSet) {
    db.action("seed", |action| {
        let db = db.clone();
        async move { apply_remote_changes(&db, &action, &changes, false).await }
    })
    .await
    .unwrap();
}

async fn seed_synced<S: LocalStore>(db: &Database<S>, id: &str, name: &str) {
    pull_into(
        db,
        task_changes(TableChanges {
            created: vec![dirty(json!({"id": id, "name": name, "position": 1}))],
            ..Default::default()
        }),
    )
    .await;
}

async fn find<S: LocalStore>(db: &Database<S>, id: &str) -> Record {
    db.collection("tasks").unwrap().find(id).await.unwrap()
}

async fn rename<S: LocalStore>(db: &Database<S>, id: &str, name: &str) {
    let task = find(db, id).await;
    let name = json!(name);
    db.action("rename", |action| {
        let db = db.clone();
        async move { db.update(&action, &task, |d| d.set("name", name)).await }
    })
    .await
    .unwrap();
}

async fn delete<S: LocalStore>(db: &Database<S>, id: &str) {
    let task = find(db, id).await;
    db.action("delete", |action| {
        let db = db.clone();
        async move { db.mark_as_deleted(&action, &task).await }
    })
    .await
    .unwrap();
}

async fn stored<S: LocalStore>(db: &Database<S>, id: &str) -> Option<RawRecord> {
    db.store().find("tasks", id).await.unwrap()
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn pull_is_idempotent() {
    let db = memory_db();
    seed_synced(&db, "t1", "synced").await;
    seed_synced(&db, "t2", "doomed").await;
    rename(&db, "t1", "local edit").await;

    let changes = task_changes(TableChanges {
        created: vec![dirty(json!({"id": "t3", "name": "new"}))],
        updated: vec![dirty(json!({"id": "t1", "name": "server", "position": 5}))],
        deleted: vec!["t2".into()],
    });

    pull_into(&db, changes.clone()).await;
    let once = db.store().export_snapshot();
    pull_into(&db, changes).await;
    let twice = db.store().export_snapshot();

    assert_eq!(once, twice);
    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.columns["name"], json!("local edit"));
    assert_eq!(t1.columns["position"], json!(5));
}

#[tokio::test]
async fn tables_are_applied_in_schema_order() {
    let db = Database::new(RecordingStore::new());
    let mut changes = task_changes(TableChanges {
        created: vec![dirty(json!({"id": "t1", "name": "task"}))],
        ..Default::default()
    });
    changes.insert(
        "projects".into(),
        TableChanges {
            created: vec![dirty(json!({"id": "p1", "name": "project"}))],
            ..Default::default()
        },
    );

    pull_into(&db, changes).await;
    assert_eq!(db.store().log(), ["begin t1", "end t1", "begin p1", "end p1"]);
}

#[tokio::test]
async fn remote_delete_destroys_locally_updated_record() {
    let db = memory_db();
    seed_synced(&db, "t1", "a").await;
    rename(&db, "t1", "edited").await;

    pull_into(
        &db,
        task_changes(TableChanges {
            deleted: vec!["t1".into()],
            ..Default::default()
        }),
    )
    .await;

    assert!(stored(&db, "t1").await.is_none());
    assert!(!has_unsynced_changes(&db).await.unwrap());
}

// Assumption, not a guarantee: a server update of a record this replica
// created and never pushed is taken as already reconciled.
#[tokio::test]
async fn remote_update_of_locally_created_record_becomes_synced() {
    let db = memory_db();
    db.action("create", |action| {
        let db = db.clone();
        async move {
            let prepared = db
                .collection("tasks")?
                .prepare_create_with_id("t1", |d| d.set("name", json!("local")))?;
            db.batch(&action, vec![prepared]).await
        }
    })
    .await
    .unwrap();

    pull_into(
        &db,
        task_changes(TableChanges {
            updated: vec![dirty(json!({"id": "t1", "name": "server"}))],
            ..Default::default()
        }),
    )
    .await;

    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.status, SyncStatus::Synced);
    assert_eq!(t1.columns["name"], json!("server"));
    assert_eq!(find(&db, "t1").await.status(), SyncStatus::Synced);
}

#[tokio::test]
async fn failed_apply_keeps_last_pulled_at() {
    let db = Database::new(RecordingStore::new());
    let changes = task_changes(TableChanges {
        created: vec![dirty(json!({"id": "t1", "name": "server"}))],
        ..Default::default()
    });
    let remote = Arc::new(ScriptedRemote::serving([
        pull(changes.clone(), 100),
        pull(changes, 100),
    ]));
    let sync = Synchronizer::new(db.clone(), remote);

    db.store().fail_next_batches(1);
    let err = sync.synchronize().await.unwrap_err();
    assert_eq!(err, Error::Storage("disk full".into()));
    assert_eq!(get_last_pulled_at(&db).await.unwrap(), None);
    assert!(stored(&db, "t1").await.is_none());

    let report = sync.synchronize().await.unwrap();
    assert_eq!(report.last_pulled_at, 100);
    assert_eq!(stored(&db, "t1").await.unwrap().status, SyncStatus::Synced);
}

#[tokio::test]
async fn columns_missing_from_remote_raw_keep_local_values() {
    let db = memory_db();
    seed_synced(&db, "t1", "base").await;
    seed_synced(&db, "t2", "base").await;
    rename(&db, "t1", "mine").await;

    pull_into(
        &db,
        task_changes(TableChanges {
            updated: vec![
                dirty(json!({"id": "t1", "name": "theirs"})),
                dirty(json!({"id": "t2", "name": "theirs", "server_rev": 4})),
            ],
            ..Default::default()
        }),
    )
    .await;

    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.columns["name"], json!("mine"));
    assert_eq!(t1.columns["position"], json!(1));
    assert_eq!(t1.status, SyncStatus::Updated);

    let t2 = stored(&db, "t2").await.unwrap();
    assert_eq!(t2.columns["name"], json!("theirs"));
    assert_eq!(t2.columns["position"], json!(1));
    assert_eq!(t2.extra["server_rev"], json!(4));
    assert_eq!(t2.status, SyncStatus::Synced);
    assert_eq!(find(&db, "t2").await.get("position"), Some(json!(1)));
}

#[tokio::test]
async fn wrongly_typed_remote_value_falls_back_to_default() {
    let db = memory_db();
    seed_synced(&db, "t1", "base").await;

    pull_into(
        &db,
        task_changes(TableChanges {
            updated: vec![dirty(json!({"id": "t1", "position": "third"}))],
            ..Default::default()
        }),
    )
    .await;

    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.columns["name"], json!("base"));
    assert_eq!(t1.columns["position"], Value::Null);
}

#[tokio::test]
async fn reset_database_pulls_everything_again() {
    let db = memory_db();
    let created = task_changes(TableChanges {
        created: vec![dirty(json!({"id": "t1", "name": "server", "position": 3}))],
        ..Default::default()
    });
    let remote = Arc::new(ScriptedRemote::serving([
        pull(created.clone(), 10),
        pull(created, 12),
    ]));
    let sync = Synchronizer::new(db.clone(), remote.clone());

    sync.synchronize().await.unwrap();
    rename(&db, "t1", "local edit").await;
    let stale = find(&db, "t1").await;

    db.action("reset", |action| {
        let db = db.clone();
        async move { db.unsafe_reset_database(&action).await }
    })
    .await
    .unwrap();
    assert_eq!(get_last_pulled_at(&db).await.unwrap(), None);
    assert!(stored(&db, "t1").await.is_none());
    assert!(!has_unsynced_changes(&db).await.unwrap());

    let report = sync.synchronize().await.unwrap();
    assert_eq!(report.last_pulled_at, 12);
    assert_eq!(remote.pulled_since(), [None, None]);

    let t1 = find(&db, "t1").await;
    assert!(!t1.same_as(&stale));
    assert_eq!(t1.get("name"), Some(json!("server")));
    assert_eq!(t1.status(), SyncStatus::Synced);
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test]
async fn local_delete_wins_over_remote_update() {
    let db = memory_db();
    seed_synced(&db, "t1", "a").await;
    delete(&db, "t1").await;

    let remote = Arc::new(ScriptedRemote::serving([pull(
        task_changes(TableChanges {
            updated: vec![dirty(json!({"id": "t1", "name": "server edit"}))],
            ..Default::default()
        }),
        100,
    )]));
    let report = Synchronizer::new(db.clone(), remote.clone())
        .synchronize()
        .await
        .unwrap();

    assert_eq!(report.applied.ignored, 1);
    let pushes = remote.pushes();
    assert_eq!(pushes[0].changes["tasks"].deleted, ["t1"]);
    assert_eq!(report.marked.purged, 1);
    assert!(stored(&db, "t1").await.is_none());
}

#[tokio::test]
async fn edit_during_push_is_not_lost() {
    let db = memory_db();
    seed_synced(&db, "t1", "a").await;
    rename(&db, "t1", "first").await;

    let started = Arc::new(Notify::new());
    let resume = Arc::new(Notify::new());
    let remote = Arc::new(ScriptedRemote {
        push_gate: Some((started.clone(), resume.clone())),
        ..Default::default()
    });
    let sync = Synchronizer::new(db.clone(), remote.clone());

    let (report, ()) = tokio::join!(sync.synchronize(), async {
        started.notified().await;
        rename(&db, "t1", "second").await;
        resume.notify_one();
    });
    let report = report.unwrap();

    assert_eq!(report.marked.left_pending, 1);
    assert_eq!(remote.pushes()[0].changes["tasks"].updated[0]["name"], json!("first"));

    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.status, SyncStatus::Updated);
    assert_eq!(t1.columns["name"], json!("second"));
    assert!(t1.changed.contains("name"));
    assert!(has_unsynced_changes(&db).await.unwrap());
}

#[tokio::test]
async fn failed_push_leaves_changes_pending() {
    let db = memory_db();
    seed_synced(&db, "t1", "a").await;
    rename(&db, "t1", "edited").await;

    let remote = Arc::new(ScriptedRemote::default());
    remote.fail_next_push.store(true, Ordering::SeqCst);
    let sync = Synchronizer::new(db.clone(), remote.clone());

    assert!(matches!(sync.synchronize().await, Err(Error::Remote(_))));
    assert_eq!(stored(&db, "t1").await.unwrap().status, SyncStatus::Updated);
    // the pull itself was committed
    assert_eq!(get_last_pulled_at(&db).await.unwrap(), Some(1));

    let report = sync.synchronize().await.unwrap();
    assert_eq!(report.pushed.updated, 1);
    assert_eq!(report.marked.marked_synced, 1);
    assert_eq!(stored(&db, "t1").await.unwrap().status, SyncStatus::Synced);
}

#[tokio::test]
async fn created_records_are_pushed_without_metadata() {
    let db = memory_db();
    db.action("create", |action| {
        let db = db.clone();
        async move {
            db.create(&action, "tasks", |d| d.set("name", json!("fresh")))
                .await
        }
    })
    .await
    .unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    Synchronizer::new(db.clone(), remote.clone())
        .synchronize()
        .await
        .unwrap();

    let pushed = &remote.pushes()[0].changes["tasks"].created[0];
    assert_eq!(pushed["name"], json!("fresh"));
    assert!(pushed.contains_key("id"));
    assert!(!pushed.contains_key("_status"));
    assert!(!pushed.contains_key("_changed"));
    assert!(!has_unsynced_changes(&db).await.unwrap());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn actions_are_serialized_at_the_store() {
    let db = Database::new(RecordingStore::new());

    let writer = |prefix: &'static str| {
        let db = db.clone();
        async move {
            db.action(prefix, |action| {
                let db = db.clone();
                async move {
                    let tasks = db.collection("tasks")?;
                    for suffix in ["a", "b"] {
                        let id = format!("{prefix}-{suffix}");
                        let prepared =
                            tasks.prepare_create_with_id(id, |d| d.set("name", json!(prefix)))?;
                        db.batch(&action, vec![prepared]).await?;
                        tokio::task::yield_now().await;
                    }
                    Ok(())
                }
            })
            .await
        }
    };

    let (x, y, z) = tokio::join!(writer("x"), writer("y"), writer("z"));
    x.unwrap();
    y.unwrap();
    z.unwrap();

    let log = db.store().log();
    assert_eq!(log.len(), 12);
    for chunk in log.chunks(4) {
        let prefix = &chunk[0]["begin ".len().."begin ".len() + 1];
        assert_eq!(
            chunk,
            [
                format!("begin {prefix}-a"),
                format!("end {prefix}-a"),
                format!("begin {prefix}-b"),
                format!("end {prefix}-b"),
            ]
        );
    }
}

#[tokio::test]
async fn concurrent_sync_is_rejected_before_writing() {
    let db = memory_db();
    let gate = Arc::new(Notify::new());
    let slow = Arc::new(ScriptedRemote {
        pulls: Mutex::new(VecDeque::from([pull(
            task_changes(TableChanges {
                created: vec![dirty(json!({"id": "from-slow", "name": "x"}))],
                ..Default::default()
            }),
            100,
        )])),
        pull_gate: Some(gate.clone()),
        ..Default::default()
    });
    let fast = Arc::new(ScriptedRemote::serving([pull(
        task_changes(TableChanges {
            created: vec![dirty(json!({"id": "from-fast", "name": "y"}))],
            ..Default::default()
        }),
        200,
    )]));

    let slow_sync = Synchronizer::new(db.clone(), slow.clone());
    let fast_sync = Synchronizer::new(db.clone(), fast);

    let (slow_result, fast_result) = tokio::join!(slow_sync.synchronize(), async {
        let report = fast_sync.synchronize().await;
        gate.notify_one();
        report
    });

    assert_eq!(fast_result.unwrap().last_pulled_at, 200);
    assert_eq!(slow_result.unwrap_err(), Error::ConcurrentSync);
    assert!(Error::ConcurrentSync.is_retryable());
    assert!(stored(&db, "from-slow").await.is_none());
    assert!(stored(&db, "from-fast").await.is_some());
    assert!(slow.pushes().is_empty());
    assert_eq!(get_last_pulled_at(&db).await.unwrap(), Some(200));
}

#[tokio::test]
async fn writes_continue_while_pull_is_in_flight() {
    let db = memory_db();
    seed_synced(&db, "t1", "a").await;

    let gate = Arc::new(Notify::new());
    let remote = Arc::new(ScriptedRemote {
        pull_gate: Some(gate.clone()),
        ..Default::default()
    });
    let sync = Synchronizer::new(db.clone(), remote);

    let (report, ()) = tokio::join!(sync.synchronize(), async {
        rename(&db, "t1", "edited offline").await;
        gate.notify_one();
    });

    assert_eq!(report.unwrap().marked.marked_synced, 1);
    let t1 = stored(&db, "t1").await.unwrap();
    assert_eq!(t1.status, SyncStatus::Synced);
    assert_eq!(t1.columns["name"], json!("edited offline"));
}

// ============================================================================
// Properties
// ============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn prop_pull_keeps_locally_changed_columns(
            local_name in "[a-z]{1,8}",
            remote_name in "[a-z]{1,8}",
            remote_position in -1000i64..1000,
        ) {
            let (name, position, status, changed) = block_on(async {
                let db = memory_db();
                seed_synced(&db, "t1", "base").await;
                rename(&db, "t1", &local_name).await;

                pull_into(&db, task_changes(TableChanges {
                    updated: vec![dirty(json!({
                        "id": "t1",
                        "name": remote_name,
                        "position": remote_position,
                    }))],
                    ..Default::default()
                }))
                .await;

                let raw = stored(&db, "t1").await.unwrap();
                (
                    raw.columns["name"].clone(),
                    raw.columns["position"].clone(),
                    raw.status,
                    raw.changed.to_string(),
                )
            });

            prop_assert_eq!(name, json!(local_name));
            prop_assert_eq!(position, json!(remote_position));
            prop_assert_eq!(status, SyncStatus::Updated);
            prop_assert_eq!(changed, "name");
        }
    }
}
