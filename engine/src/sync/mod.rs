//! Synchronization with a remote replica.
//!
//! A sync runs in two phases:
//!
//! 1. **Pull**: the server sends every change since `lastPulledAt` together
//!    with its current timestamp. In one action, the engine checks that no
//!    other sync committed in the meantime, applies the changes in a
//!    sub-action and stores the new timestamp.
//! 2. **Push**: local changes are captured without blocking writes and sent
//!    to the server. Once the server accepted them, an action marks the
//!    records as synced, skipping those modified since the capture.
//!
//! A failure at any point leaves the local replica in a state from which the
//! next sync converges: applying the same pull twice is harmless, and
//! records that were not marked as synced are simply pushed again.

mod apply_remote;
mod local_changes;
mod timestamp;
mod types;

pub use apply_remote::apply_remote_changes;
pub use local_changes::{fetch_local_changes, has_unsynced_changes, mark_local_changes_as_synced};
pub use timestamp::{get_last_pulled_at, set_last_pulled_at, LAST_PULLED_AT_KEY};
pub use types::{
    ApplyStats, ChangeCounts, LocalChangeSet, MarkStats, SyncDatabaseChangeSet, SyncPullResult,
    SyncPushArgs, SyncReport, TableChanges,
};

use crate::adapter::LocalStore;
use crate::database::Database;
use crate::{error::Result, Error, Timestamp};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server side of the protocol, supplied by the host.
///
/// Transport failures are reported as [`Error::Remote`]. A push the server
/// rejects (for instance because a pushed record changed on the server after
/// `last_pulled_at`) must fail as a whole.
pub trait SyncRemote: Send + Sync + 'static {
    /// Changes since `last_pulled_at`, or everything when `None`.
    fn pull_changes(
        &self,
        last_pulled_at: Option<Timestamp>,
    ) -> impl Future<Output = Result<SyncPullResult>> + Send;

    /// Apply local changes on the server.
    fn push_changes(&self, args: SyncPushArgs) -> impl Future<Output = Result<()>> + Send;
}

/// Sync behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// The server reports records created since the last pull in its
    /// `updated` list; creating them locally is then expected and not
    /// logged as a server anomaly.
    pub send_created_as_updated: bool,
}

/// Where a [`Synchronizer`] currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    Pulling,
    ApplyingRemote,
    Pushing,
    MarkingSynced,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Pulling => "pulling",
            SyncPhase::ApplyingRemote => "applying remote changes",
            SyncPhase::Pushing => "pushing",
            SyncPhase::MarkingSynced => "marking local changes as synced",
        };
        f.write_str(name)
    }
}

/// Runs synchronizations of one database against one remote.
pub struct Synchronizer<S: LocalStore, R: SyncRemote> {
    database: Database<S>,
    remote: Arc<R>,
    options: SyncOptions,
    phase: Mutex<SyncPhase>,
}

impl<S: LocalStore, R: SyncRemote> fmt::Debug for Synchronizer<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("options", &self.options)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<S: LocalStore, R: SyncRemote> Synchronizer<S, R> {
    pub fn new(database: Database<S>, remote: Arc<R>) -> Self {
        Self::with_options(database, remote, SyncOptions::default())
    }

    pub fn with_options(database: Database<S>, remote: Arc<R>, options: SyncOptions) -> Self {
        Self {
            database,
            remote,
            options,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn database(&self) -> &Database<S> {
        &self.database
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: SyncPhase) {
        debug!(%phase, "sync phase");
        *self.phase.lock() = phase;
    }

    /// Pull remote changes, then push local ones.
    ///
    /// Fails with [`Error::ConcurrentSync`] if this synchronizer is already
    /// running, or if another sync of the same database applied a pull
    /// while this one was waiting for the server.
    pub async fn synchronize(&self) -> Result<SyncReport> {
        let _running = PhaseGuard::start(&self.phase)?;
        let result = self.run().await;
        if let Err(e) = &result {
            warn!(error = %e, retryable = e.is_retryable(), "sync failed");
        }
        result
    }

    async fn run(&self) -> Result<SyncReport> {
        let db = &self.database;

        self.enter(SyncPhase::Pulling);
        let last_pulled_at = get_last_pulled_at(db).await?;
        let SyncPullResult {
            changes: remote_changes,
            timestamp: new_last_pulled_at,
        } = self.remote.pull_changes(last_pulled_at).await?;
        let pulled = ChangeCounts::of(&remote_changes);

        self.enter(SyncPhase::ApplyingRemote);
        let send_created_as_updated = self.options.send_created_as_updated;
        let applied = db
            .action("sync-synchronize-apply", |action| async move {
                if get_last_pulled_at(db).await? != last_pulled_at {
                    return Err(Error::ConcurrentSync);
                }
                let stats = action
                    .sub_action(|sub| async move {
                        apply_remote_changes(db, &sub, &remote_changes, send_created_as_updated)
                            .await
                    })
                    .await?;
                set_last_pulled_at(db, &action, new_last_pulled_at).await?;
                Ok(stats)
            })
            .await?;

        self.enter(SyncPhase::Pushing);
        let local_changes = fetch_local_changes(db).await?;
        let pushed = local_changes.counts();
        self.remote
            .push_changes(SyncPushArgs {
                changes: local_changes.changes.clone(),
                last_pulled_at: new_last_pulled_at,
            })
            .await?;

        self.enter(SyncPhase::MarkingSynced);
        let marked = mark_local_changes_as_synced(db, &local_changes).await?;

        let report = SyncReport {
            last_pulled_at: new_last_pulled_at,
            pulled,
            applied,
            pushed,
            marked,
        };
        info!(
            last_pulled_at = new_last_pulled_at,
            pulled = pulled.total(),
            conflicts = applied.conflicts,
            pushed = pushed.total(),
            left_pending = marked.left_pending,
            "sync finished"
        );
        Ok(report)
    }
}

/// Claims a synchronizer for one run and returns it to idle when dropped.
struct PhaseGuard<'a>(&'a Mutex<SyncPhase>);

impl<'a> PhaseGuard<'a> {
    fn start(phase: &'a Mutex<SyncPhase>) -> Result<Self> {
        let mut current = phase.lock();
        if *current != SyncPhase::Idle {
            return Err(Error::ConcurrentSync);
        }
        *current = SyncPhase::Pulling;
        Ok(Self(phase))
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = SyncPhase::Idle;
    }
}
