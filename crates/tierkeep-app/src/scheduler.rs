//! Periodic trigger that scans every due monitored path.
//!
//! # Design
//! - Each tick lists enabled paths and spawns one `process_path` task per due path, so
//!   paths are scanned independently and concurrently.
//! - Overlap with a still-running scan is resolved by the engine, which reports it as
//!   skipped.
//! - Spawned scans live in a `JoinSet` owned by the scheduler task; aborting the
//!   scheduler drops the set and aborts every scan still in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tierkeep_data::{MonitoredPath, Store};
use tierkeep_engine::{EngineError, FileWorkflow};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Calls `process_path` for each monitored path whose interval has elapsed.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    workflow: FileWorkflow,
    tick: Duration,
}

impl Scheduler {
    /// Scheduler checking for due paths every `tick`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, workflow: FileWorkflow, tick: Duration) -> Self {
        Self {
            store,
            workflow,
            tick,
        }
    }

    /// Identifiers of paths due for a scan at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    pub async fn due_paths(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|err| AppError::data("scheduler.begin", err))?;
        let paths = tx
            .list_paths()
            .await
            .map_err(|err| AppError::data("scheduler.list_paths", err))?;
        tx.commit()
            .await
            .map_err(|err| AppError::data("scheduler.commit", err))?;
        Ok(select_due(&paths, now))
    }

    /// Start a scan in `scans` for every due path; returns how many were started.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    pub async fn schedule(&self, scans: &mut JoinSet<()>) -> AppResult<usize> {
        let due = self.due_paths(Utc::now()).await?;
        if !due.is_empty() {
            debug!(count = due.len(), "monitored paths due for scan");
        }
        for path_id in &due {
            let workflow = self.workflow.clone();
            let path_id = *path_id;
            scans.spawn(async move { scan(&workflow, path_id).await });
        }
        Ok(due.len())
    }

    /// Start scans for every due path in a fresh set. Dropping the set aborts them.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    pub async fn tick_once(&self) -> AppResult<JoinSet<()>> {
        let mut scans = JoinSet::new();
        self.schedule(&mut scans).await?;
        Ok(scans)
    }

    /// Tick until the returned handle is aborted, which also aborts running scans.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut scans = JoinSet::new();
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                reap(&mut scans);
                if let Err(err) = self.schedule(&mut scans).await {
                    warn!(error = %err, "scheduler tick failed");
                }
            }
        })
    }
}

fn select_due(paths: &[MonitoredPath], now: DateTime<Utc>) -> Vec<Uuid> {
    paths
        .iter()
        .filter(|path| path.is_due(now))
        .map(|path| path.id)
        .collect()
}

fn reap(scans: &mut JoinSet<()>) {
    while let Some(joined) = scans.try_join_next() {
        if let Err(err) = joined {
            warn!(error = %err, "scheduled scan task ended abnormally");
        }
    }
}

async fn scan(workflow: &FileWorkflow, path_id: Uuid) {
    match workflow.process_path(path_id).await {
        Ok(result) if result.scan_skipped => {
            debug!(path_id = %path_id, "scan still running from a previous tick");
        }
        Ok(result) => info!(
            path_id = %path_id,
            moved = result.files_moved,
            thawed = result.files_thawed,
            errors = result.errors.len(),
            "scheduled scan finished"
        ),
        Err(EngineError::PathInError { message, .. }) => {
            warn!(path_id = %path_id, error = %message, "monitored path needs attention");
        }
        Err(err) => warn!(path_id = %path_id, error = %err, "scheduled scan failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tierkeep_data::OperationMode;

    #[test]
    fn only_enabled_overdue_paths_are_selected() {
        let now = Utc::now();
        let never = MonitoredPath::new("never", "/srv/a", OperationMode::Move);
        let mut recent = MonitoredPath::new("recent", "/srv/b", OperationMode::Move);
        recent.last_scan_at = Some(now - ChronoDuration::minutes(5));
        let mut overdue = MonitoredPath::new("overdue", "/srv/c", OperationMode::Move);
        overdue.last_scan_at = Some(now - ChronoDuration::hours(2));
        let mut disabled = MonitoredPath::new("disabled", "/srv/d", OperationMode::Move);
        disabled.enabled = false;

        let due = select_due(&[never.clone(), recent, overdue.clone(), disabled], now);
        assert_eq!(due, vec![never.id, overdue.id]);
    }
}
