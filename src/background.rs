//! Detached work that outlives the request that scheduled it.
//!
//! Tasks are spawned onto the tokio runtime immediately, so dropping or
//! cancelling the originating request future does not affect them.  The
//! registry only keeps their handles so the server can wait for in-flight
//! work at shutdown and tests can observe its effects.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::warn;

#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` to completion independently of the caller.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        // Reap finished tasks so the set does not grow with traffic.
        while let Some(result) = tasks.try_join_next() {
            log_join_error(result);
        }
        tasks.spawn(fut);
    }

    /// Wait for every task spawned so far.
    pub async fn settle(&self) {
        let mut pending = std::mem::take(&mut *self.lock());
        while let Some(result) = pending.join_next().await {
            log_join_error(result);
        }
    }

    /// [`settle`](Self::settle), giving up after `timeout`.  Returns
    /// whether everything finished.
    pub async fn settle_with_timeout(&self, timeout: Duration) -> bool {
        let mut pending = std::mem::take(&mut *self.lock());
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = pending.join_next().await {
                log_join_error(result);
            }
        })
        .await
        .is_ok();
        if !drained {
            // Leave the stragglers running rather than aborting them.
            pending.detach_all();
        }
        drained
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        warn!("Background task ended abnormally: {}", e);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        // JoinSet aborts its tasks on drop; detached work must not be cut off.
        self.lock().detach_all();
    }
}
