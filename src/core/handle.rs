//! Observable task handles

use crate::core::CancelFlag;
use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared state of a running operation that can be polled for progress
pub trait Observable: Send + Sync + 'static {
    /// Point-in-time view of the progress counters
    type Snapshot: Clone + Send + std::fmt::Debug;

    /// Read the current counters
    fn snapshot(&self) -> Self::Snapshot;

    /// Flag that stops the operation at its next suspension point
    fn cancel_flag(&self) -> &CancelFlag;
}

/// Handle to a spawned operation
///
/// Progress is polled through [`progress`](Self::progress); the single
/// terminal outcome is obtained with [`wait`](Self::wait). Counters stay
/// readable after a failure.
pub struct TaskHandle<S: Observable, T> {
    state: Arc<S>,
    join: JoinHandle<Result<T>>,
}

impl<S: Observable, T: Send + 'static> TaskHandle<S, T> {
    /// Spawn `fut` on the current runtime and track it through `state`
    pub fn spawn<Fut>(state: Arc<S>, fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            state,
            join: tokio::spawn(fut),
        }
    }

    /// Current progress counters
    pub fn progress(&self) -> S::Snapshot {
        self.state.snapshot()
    }

    /// Shared state of the operation
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.state.cancel_flag().cancel();
    }

    /// Whether the operation has reached its terminal outcome
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> Result<T> {
        self.join.await?
    }
}

impl<S: Observable, T> std::fmt::Debug for TaskHandle<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("progress", &self.state.snapshot())
            .field("finished", &self.join.is_finished())
            .finish()
    }
}
