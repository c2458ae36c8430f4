//! Goal manager (§4.5): tracks in-flight asynchronous goals and lets
//! callers await their completion. A goal represents "I have issued a state
//! change; the system is converging." The controller never blocks on its
//! own goals inside the write lock — only external callers do.

use std::collections::HashMap;
use std::sync::Arc;

use fleetctl_types::GoalId;
use parking_lot::Mutex;
use tokio::sync::Notify;

struct GoalState {
    /// `None` while pending. `Some(None)` on success, `Some(Some(err))` on
    /// failure.
    resolved: Mutex<Option<Option<String>>>,
    notify: Notify,
}

impl GoalState {
    fn new() -> Self {
        GoalState {
            resolved: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

/// Single-producer (the owning controller), multi-consumer (clients) goal
/// tracker. Cloning is cheap; all clones share the same goal table.
#[derive(Clone, Default)]
pub struct GoalManager {
    goals: Arc<Mutex<HashMap<GoalId, Arc<GoalState>>>>,
}

impl GoalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh unresolved goal and returns its id.
    pub fn create_goal(&self) -> GoalId {
        let id = GoalId::new();
        self.goals.lock().insert(id, Arc::new(GoalState::new()));
        id
    }

    /// Resolves the goal. Idempotent: a goal that is already resolved keeps
    /// its first outcome.
    pub fn complete(&self, id: GoalId, error: Option<String>) {
        let state = self.goals.lock().get(&id).cloned();
        let Some(state) = state else { return };
        let mut resolved = state.resolved.lock();
        if resolved.is_none() {
            *resolved = Some(error);
            drop(resolved);
            state.notify.notify_waiters();
        }
    }

    /// Blocks until the goal resolves, returning the error (if any) or
    /// `None` on success. Returns `None` immediately for an unknown goal id.
    pub async fn wait_for_goal(&self, id: GoalId) -> Option<String> {
        let Some(state) = self.goals.lock().get(&id).cloned() else {
            return None;
        };
        loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            // Register interest in `notified` before re-checking, so a
            // `complete()` racing with this check cannot be missed.
            notified.as_mut().enable();
            if let Some(outcome) = state.resolved.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Count of goals that have not yet resolved.
    pub fn num_pending_goals(&self) -> usize {
        self.goals
            .lock()
            .values()
            .filter(|s| s.resolved.lock().is_none())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_goal_returns_success() {
        let mgr = GoalManager::new();
        let id = mgr.create_goal();
        assert_eq!(mgr.num_pending_goals(), 1);
        mgr.complete(id, None);
        assert_eq!(mgr.wait_for_goal(id).await, None);
        assert_eq!(mgr.num_pending_goals(), 0);
    }

    #[tokio::test]
    async fn wait_for_goal_returns_error() {
        let mgr = GoalManager::new();
        let id = mgr.create_goal();
        mgr.complete(id, Some("boom".into()));
        assert_eq!(mgr.wait_for_goal(id).await, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let mgr = GoalManager::new();
        let id = mgr.create_goal();
        mgr.complete(id, Some("first".into()));
        mgr.complete(id, Some("second".into()));
        assert_eq!(mgr.wait_for_goal(id).await, Some("first".to_string()));
    }

    #[tokio::test]
    async fn wait_for_goal_blocks_until_completed_concurrently() {
        let mgr = GoalManager::new();
        let id = mgr.create_goal();
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.wait_for_goal(id).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.complete(id, None);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_goal_resolves_immediately() {
        let mgr = GoalManager::new();
        let id = GoalId::new();
        assert_eq!(mgr.wait_for_goal(id).await, None);
    }
}
