//! Stale object sweeper.
//!
//! Walks the metadata index in key order, one bounded batch at a time,
//! and removes every entry whose last use is at or before the staleness
//! cutoff.  Blobs go first and index rows second, so an interrupted sweep
//! can only leave dangling rows behind, which the next sweep picks up.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::SweeperConfig;
use crate::handlers::cache::unix_now;
use crate::metadata::store::MetadataIndex;
use crate::metrics::{SWEEP_DELETED_TOTAL, SWEEP_RUNS_TOTAL};
use crate::storage::backend::StorageBackend;
use crate::AppState;

/// Outcome of one completed sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Non-empty batches processed.
    pub batches: u64,
    /// Index rows removed.
    pub deleted: u64,
}

/// Cursor over the stale keys of an index.
///
/// Each call to [`next_batch`](Self::next_batch) resumes strictly after
/// the last key it returned, so deleting a batch never shifts the window.
pub struct StaleBatches<'a> {
    metadata: &'a dyn MetadataIndex,
    marker: String,
    stale_before: i64,
    batch_size: usize,
}

impl<'a> StaleBatches<'a> {
    pub fn new(metadata: &'a dyn MetadataIndex, stale_before: i64, batch_size: usize) -> Self {
        Self {
            metadata,
            marker: String::new(),
            stale_before,
            batch_size: batch_size.max(1),
        }
    }

    /// The next batch of stale keys, or `None` once the index is exhausted.
    pub async fn next_batch(&mut self) -> anyhow::Result<Option<Vec<String>>> {
        let keys = self
            .metadata
            .list_stale(&self.marker, self.stale_before, self.batch_size)
            .await?;
        match keys.last() {
            Some(last) => {
                self.marker = last.clone();
                Ok(Some(keys))
            }
            None => Ok(None),
        }
    }
}

/// Remove every entry last used at or before `now - staleness_threshold`.
///
/// Stops at the first failing batch.  Batches already processed stay
/// deleted; the failing batch keeps its index rows.
pub async fn sweep(
    metadata: &dyn MetadataIndex,
    storage: &dyn StorageBackend,
    config: &SweeperConfig,
    now: i64,
) -> anyhow::Result<SweepReport> {
    let threshold = i64::try_from(config.staleness_threshold_seconds).unwrap_or(i64::MAX);
    let stale_before = now.saturating_sub(threshold);
    let mut cursor = StaleBatches::new(metadata, stale_before, config.batch_size);
    let mut report = SweepReport::default();

    while let Some(keys) = cursor.next_batch().await? {
        storage.delete_many(&keys).await?;
        let removed = metadata.delete_many(&keys).await?;
        debug!("Sweep batch: {} keys, {} rows removed", keys.len(), removed);
        report.batches += 1;
        report.deleted += removed;
    }

    Ok(report)
}

/// Run [`sweep`] against the server's stores and record the outcome.
pub async fn sweep_once(state: &AppState) -> anyhow::Result<SweepReport> {
    let result = sweep(
        state.metadata.as_ref(),
        state.storage.as_ref(),
        &state.config.sweeper,
        unix_now(),
    )
    .await;

    match &result {
        Ok(report) => {
            counter!(SWEEP_RUNS_TOTAL, "outcome" => "ok").increment(1);
            counter!(SWEEP_DELETED_TOTAL).increment(report.deleted);
            info!(
                "Sweep complete: {} stale entries removed in {} batches",
                report.deleted, report.batches
            );
        }
        Err(e) => {
            counter!(SWEEP_RUNS_TOTAL, "outcome" => "error").increment(1);
            error!("Sweep failed: {:#}", e);
        }
    }
    result
}

/// Spawn a task that sweeps every `period`, first one `period` after start.
pub fn spawn_sweeper(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            // Errors are logged inside; the next tick tries again.
            let _ = sweep_once(&state).await;
        }
    })
}
