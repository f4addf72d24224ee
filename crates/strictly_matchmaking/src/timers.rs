//! Delayed tasks with explicit cancellation.
//!
//! Every timer is a spawned tokio task. The owner keeps the handles and
//! cancels them deterministically; nothing relies on drop order.

use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, instrument};

/// Cancellation handle for one scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancels the task if it has not run yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// True once the task completed or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// The set of timers owned by one component.
#[derive(Debug, Default)]
pub struct TimerSet {
    handles: Vec<AbortHandle>,
}

impl TimerSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, task))]
    pub fn after<F, Fut>(&mut self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
        });
        self.track(join.abort_handle())
    }

    /// Adds an externally spawned task to the set.
    pub fn track(&mut self, abort: AbortHandle) -> TimerHandle {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(abort.clone());
        TimerHandle { abort }
    }

    /// Cancels every pending task; returns how many were still pending.
    #[instrument(skip(self))]
    pub fn cancel_all(&mut self) -> usize {
        let pending = self.handles.iter().filter(|h| !h.is_finished()).count();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        if pending > 0 {
            debug!(pending, "Cancelled pending timers");
        }
        pending
    }

    /// Number of tasks not yet finished.
    pub fn pending(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }
}
