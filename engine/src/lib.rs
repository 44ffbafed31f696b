//! # Tandem Engine
//!
//! The offline-first synchronization core of a local reactive data store.
//!
//! A local replica of a record set is kept eventually consistent with a
//! remote replica. Conflicts are resolved on the client without server
//! cooperation, and local reads and writes stay available while a
//! synchronization runs.
//!
//! ## Core Concepts
//!
//! ### Change tracking
//!
//! Every record carries a [`SyncStatus`] and a set of [`ChangedColumns`].
//! Together they are the only record of what has to be pushed; there is no
//! separate operation log. See [`change_tracker`].
//!
//! ### Actions
//!
//! All writes run inside an [`Action`] scheduled by the [`ActionQueue`]: one
//! top-level action at a time, in FIFO order, with nested sub-actions run
//! inline. Write APIs take the action token and reject tokens that are not
//! currently running.
//!
//! ### Conflict resolution
//!
//! [`resolve_conflict`] merges a server version into a locally modified
//! record, per column, client wins: columns changed locally keep their local
//! values and everything else comes from the server.
//!
//! ### Synchronization
//!
//! The [`Synchronizer`] runs pull, apply, push and mark-as-synced against a
//! host supplied [`SyncRemote`]. Applying remote changes and committing a push
//! are actions, so they serialize with application writes and can never lose
//! an update made while the network round trip was in flight.
//!
//! ## Quick Start
//!
//! ```rust
//! use tandem_engine::{
//!     AppSchema, ColumnSchema, ColumnType, Database, MemoryStore, SyncStatus, TableSchema,
//! };
//! use serde_json::json;
//!
//! # tokio_test_block_on(async {
//! // 1. Define a schema
//! let schema = AppSchema::new(1).with_table(TableSchema::new(
//!     "tasks",
//!     vec![
//!         ColumnSchema::required("name", ColumnType::String),
//!         ColumnSchema::optional("position", ColumnType::Number),
//!     ],
//! ));
//!
//! // 2. Open a database over a store
//! let db = Database::new(MemoryStore::new(schema));
//!
//! // 3. Write inside an action
//! let task = db
//!     .action("create task", |action| {
//!         let db = db.clone();
//!         async move {
//!             db.create(&action, "tasks", |draft| draft.set("name", json!("Buy milk")))
//!                 .await
//!         }
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(task.status(), SyncStatus::Created);
//! assert_eq!(task.get("name"), Some(json!("Buy milk")));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryStore`] is the reference [`LocalStore`]. Use
//! [`MemoryStore::export_snapshot`] and [`MemoryStore::import_snapshot`] with
//! [`StoreSnapshot`] to persist it as deterministic JSON.

pub mod action_queue;
pub mod adapter;
pub mod cache;
pub mod change_tracker;
pub mod collection;
pub mod conflict;
pub mod database;
pub mod error;
pub mod id;
pub mod memory;
pub mod model;
pub mod query;
pub mod raw;
pub mod schema;
pub mod snapshot;
pub mod sync;

// Re-export main types at crate root
pub use action_queue::{Action, ActionQueue};
pub use adapter::{BatchOperation, LocalStore};
pub use cache::RecordCache;
pub use collection::Collection;
pub use conflict::resolve_conflict;
pub use database::{ChangeKind, CollectionChange, Database};
pub use error::Error;
pub use id::random_id;
pub use memory::MemoryStore;
pub use model::{PreparedKind, PreparedRecord, Record, RecordDraft};
pub use query::{Condition, TableQuery};
pub use raw::{ChangedColumns, DirtyRaw, RawRecord, SyncStatus};
pub use schema::{AppSchema, ColumnSchema, ColumnType, TableSchema};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use sync::{
    has_unsynced_changes, ApplyStats, LocalChangeSet, MarkStats, SyncDatabaseChangeSet,
    SyncOptions, SyncPhase, SyncPullResult, SyncPushArgs, SyncRemote, SyncReport,
    Synchronizer, TableChanges,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type ColumnName = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
