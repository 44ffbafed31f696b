//! Serialized execution of mutating work.
//!
//! Every write to the local database runs inside an *action*. The queue runs
//! top-level actions one at a time, in the order they asked for their turn.
//! A running action may run sub-actions inline, which complete before the
//! action itself does, so a whole tree of work appears atomic to any other
//! action.
//!
//! The running state (current action, sub-action depth) is owned by each
//! queue. Write APIs take an [`Action`] token and check it against that state
//! with [`ActionQueue::ensure_in_action`], so a token that escaped its action
//! is rejected instead of racing.

use crate::{error::Result, Error};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Running {
    id: u64,
    label: Arc<str>,
    depth: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    running: Option<Running>,
    waiting: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Fair lock: waiters are granted their turn in FIFO order.
    turn: tokio::sync::Mutex<()>,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

/// FIFO scheduler of actions.
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    inner: Arc<QueueInner>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` as a top-level action once every earlier action finished.
    ///
    /// The result of `work` is returned as is. A failing action does not
    /// affect the ones queued after it.
    pub async fn enqueue<T, F, Fut>(&self, label: impl Into<String>, work: F) -> Result<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let label: Arc<str> = Arc::from(label.into());

        let waiting = WaitingGuard::new(&self.inner);
        let _turn = self.inner.turn.lock().await;
        drop(waiting);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let _running = RunningGuard::enter(&self.inner, id, label.clone());
        debug!(action = %label, action_id = id, "action started");

        let action = Action {
            id,
            depth: 0,
            label: label.clone(),
            queue: self.inner.clone(),
        };
        let result = work(action).await;

        match &result {
            Ok(_) => debug!(action = %label, action_id = id, "action finished"),
            Err(e) => warn!(action = %label, action_id = id, error = %e, "action failed"),
        }
        result
    }

    /// Fail unless `action` is the innermost running action of this queue.
    pub fn ensure_in_action(&self, action: &Action, message: &str) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &action.queue) {
            return Err(Error::NotInAction(format!(
                "{message} (action '{}' belongs to another queue)",
                action.label
            )));
        }
        action.ensure_current(message)
    }

    /// Whether an action is running right now.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// Label of the running action, if any.
    pub fn current_label(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .running
            .as_ref()
            .map(|r| r.label.to_string())
    }

    /// Sub-action depth of the running action (0 for the action itself).
    pub fn depth(&self) -> Option<usize> {
        self.inner.state.lock().running.as_ref().map(|r| r.depth)
    }

    /// Number of actions waiting or running.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.waiting + usize::from(state.running.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a running action, passed to its work.
#[derive(Debug, Clone)]
pub struct Action {
    id: u64,
    depth: usize,
    label: Arc<str>,
    queue: Arc<QueueInner>,
}

impl Action {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// 0 for a top-level action, +1 per sub-action level.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this is the innermost running action of its queue.
    pub fn is_current(&self) -> bool {
        self.queue
            .state
            .lock()
            .running
            .as_ref()
            .is_some_and(|r| r.id == self.id && r.depth == self.depth)
    }

    fn ensure_current(&self, message: &str) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::NotInAction(message.to_string()))
        }
    }

    /// Run `work` nested in this action, before this action completes.
    ///
    /// While the sub-action runs, only its own token is current: this token
    /// becomes usable again once the sub-action returned.
    pub async fn sub_action<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_current("sub_action() can only be called from inside of the running action")?;

        let _depth = DepthGuard::enter(&self.queue);
        let child = Action {
            depth: self.depth + 1,
            ..self.clone()
        };
        debug!(action = %self.label, depth = child.depth, "sub-action started");
        work(child).await
    }
}

struct WaitingGuard<'a>(&'a QueueInner);

impl<'a> WaitingGuard<'a> {
    fn new(inner: &'a QueueInner) -> Self {
        inner.state.lock().waiting += 1;
        Self(inner)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().waiting -= 1;
    }
}

struct RunningGuard<'a>(&'a QueueInner);

impl<'a> RunningGuard<'a> {
    fn enter(inner: &'a QueueInner, id: u64, label: Arc<str>) -> Self {
        inner.state.lock().running = Some(Running {
            id,
            label,
            depth: 0,
        });
        Self(inner)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().running = None;
    }
}

struct DepthGuard<'a>(&'a QueueInner);

impl<'a> DepthGuard<'a> {
    fn enter(inner: &'a QueueInner) -> Self {
        if let Some(running) = inner.state.lock().running.as_mut() {
            running.depth += 1;
        }
        Self(inner)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        if let Some(running) = self.0.state.lock().running.as_mut() {
            running.depth = running.depth.saturating_sub(1);
        }
    }
}
