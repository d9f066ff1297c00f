//! Routine pool: structured concurrency for cooperating tasks
//!
//! A small supervisor pairing a shared `CancellationToken` with a
//! `TaskTracker`. Servers use one pool per listener for their connection
//! tasks; the process root owns the pool every server hangs off.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A set of cooperating tasks with a shared cancellation signal.
///
/// Tasks receive a child token and are expected to select on it; `wait`
/// joins everything that was ever added. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct RoutinePool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl RoutinePool {
    /// Create a root pool with a fresh cancellation token.
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Create a pool whose cancellation is chained to `parent`.
    pub fn with_token(parent: CancellationToken) -> Self {
        Self {
            token: parent,
            tracker: TaskTracker::new(),
        }
    }

    /// Derive a child pool: cancelling the parent cancels the child, but
    /// the child can be cancelled and awaited on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// The pool's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Register a task. The closure receives a child token tied to the
    /// pool; the task must finish once that token is cancelled.
    pub fn add<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(f(self.token.child_token()));
    }

    /// Signal every task to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for all registered tasks to return. Further `add` calls are
    /// rejected by the tracker once this has been called.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for RoutinePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_reaches_every_task() {
        let pool = RoutinePool::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let stopped = stopped.clone();
            pool.add(|token| async move {
                token.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.cancel();
        pool.wait().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_wait_joins_completed_tasks() {
        let pool = RoutinePool::new();
        pool.add(|_| async {});
        pool.add(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        pool.wait().await;
    }

    #[tokio::test]
    async fn test_child_pool_cancelled_by_parent() {
        let parent = RoutinePool::new();
        let child = parent.child();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        child.add(|token| async move {
            token.cancelled().await;
            d.fetch_add(1, Ordering::SeqCst);
        });

        parent.cancel();
        child.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_running() {
        let parent = RoutinePool::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.token().is_cancelled());
    }
}
