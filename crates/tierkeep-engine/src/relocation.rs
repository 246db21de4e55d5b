//! Background migration of cold files between storage locations.
//!
//! # Design
//! - One coarse lock guards the task map. `create_task` checks for an active task and
//!   inserts the new one in the same critical section, so each inventory entry has at most
//!   one pending or running relocation.
//! - A single worker drains the queue in FIFO order; relocations never overlap.
//! - While a task runs, its inventory entry is `migrating`. Success leaves the entry
//!   `active` at the new location; failure restores `active` at the old one.
//! - No filesystem or store I/O happens while the lock is held.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tierkeep_config::RelocationSettings;
use tierkeep_data::{
    ColdStorageLocation, FileInventoryEntry, FileRecord, FileStatus, MonitoredPath,
    OperationFailure, OperationMode, StorageTier, Store,
};
use tierkeep_fsops::{FileMover, Payload, create_symlink, remove_symlink};
use tierkeep_telemetry::Metrics;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::operations::suppress_indexing;
use crate::workflow::describe;

/// Lifecycle state of a relocation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationStatus {
    /// Queued.
    Pending,
    /// Being transferred.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RelocationStatus {
    /// Whether the task still owns its inventory entry.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot of one relocation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocationTask {
    /// Task identifier.
    pub id: Uuid,
    /// Inventory entry being moved.
    pub inventory_id: Uuid,
    /// Current location.
    pub source_location_id: Uuid,
    /// Current location name.
    pub source_location_name: String,
    /// Destination location.
    pub target_location_id: Uuid,
    /// Destination location name.
    pub target_location_name: String,
    /// Lifecycle state.
    pub status: RelocationStatus,
    /// Bytes expected.
    pub bytes_total: u64,
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the worker picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure description.
    pub error: Option<String>,
}

struct RelocationInner {
    store: Arc<dyn Store>,
    mover: FileMover,
    metrics: Metrics,
    retention: Duration,
    tasks: Mutex<HashMap<Uuid, RelocationTask>>,
    sender: mpsc::UnboundedSender<Uuid>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

/// Queue and worker for cold-to-cold relocations.
#[derive(Clone)]
pub struct RelocationManager {
    inner: Arc<RelocationInner>,
}

/// Everything the worker needs to move one file, read in a single transaction.
struct Plan {
    entry: FileInventoryEntry,
    path: MonitoredPath,
    source: ColdStorageLocation,
    target: ColdStorageLocation,
    record: Option<FileRecord>,
    destination: PathBuf,
}

impl RelocationManager {
    /// Manager with an idle queue; call [`Self::spawn_worker`] to start processing.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        mover: FileMover,
        metrics: Metrics,
        settings: &RelocationSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RelocationInner {
                store,
                mover,
                metrics,
                retention: settings.retention(),
                tasks: Mutex::new(HashMap::new()),
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    /// Start the queue worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] when a worker was already started.
    pub fn spawn_worker(&self) -> EngineResult<JoinHandle<()>> {
        let receiver = lock_or_recover(&self.inner.receiver, "relocation receiver").take();
        let mut receiver =
            receiver.ok_or_else(|| EngineError::invalid("relocation_worker", "already_started", "worker"))?;
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(task_id) = receiver.recv().await {
                manager.run_task(task_id).await;
            }
            debug!("relocation queue closed");
        }))
    }

    /// Queue a relocation of a cold inventory entry to another location.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown entry or location,
    /// [`EngineError::InvalidInput`] when the entry is not in cold storage, the target
    /// is its current location or unavailable, or the target is encrypted and the file
    /// is reached through a symlink, and
    /// [`EngineError::RelocationConflict`] when a task for the entry is already active.
    pub async fn create_task(
        &self,
        inventory_id: Uuid,
        target_location_id: Uuid,
    ) -> EngineResult<RelocationTask> {
        let mut tx = self.inner.store.begin().await?;
        let entry = tx
            .get_inventory(inventory_id)
            .await?
            .ok_or_else(|| EngineError::not_found("inventory", inventory_id))?;
        let source_id = match (entry.storage_tier, entry.cold_location_id) {
            (StorageTier::Cold, Some(id)) => id,
            _ => return Err(EngineError::invalid("inventory", "not_cold", inventory_id)),
        };
        if source_id == target_location_id {
            return Err(EngineError::invalid(
                "target_location_id",
                "same_location",
                target_location_id,
            ));
        }
        let source = tx
            .get_location(source_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cold_location", source_id))?;
        let target = tx
            .get_location(target_location_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cold_location", target_location_id))?;
        let symlinked = tx
            .find_record_by_cold_path(&entry.file_path)
            .await?
            .is_some_and(|record| record.operation_mode == OperationMode::Symlink);
        tx.commit().await?;
        if !target.is_available {
            return Err(EngineError::invalid(
                "target_location_id",
                "unavailable",
                target.name,
            ));
        }
        if symlinked && target.is_encrypted {
            return Err(EngineError::invalid(
                "target_location_id",
                "encrypted_for_symlink",
                target.name,
            ));
        }

        let task = RelocationTask {
            id: Uuid::new_v4(),
            inventory_id,
            source_location_id: source.id,
            source_location_name: source.name,
            target_location_id: target.id,
            target_location_name: target.name,
            status: RelocationStatus::Pending,
            bytes_total: entry.file_size,
            bytes_done: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        {
            let mut tasks = self.lock();
            if tasks
                .values()
                .any(|existing| existing.inventory_id == inventory_id && existing.status.is_active())
            {
                return Err(EngineError::RelocationConflict { inventory_id });
            }
            tasks.insert(task.id, task.clone());
        }
        if self.inner.sender.send(task.id).is_err() {
            self.finish(task.id, Err("relocation queue closed".to_string()));
            return Err(EngineError::invalid("relocation_worker", "stopped", task.id));
        }
        self.publish_queue_depth();
        info!(
            task_id = %task.id,
            inventory_id = %inventory_id,
            source = %task.source_location_name,
            target = %task.target_location_name,
            "relocation queued"
        );
        Ok(task)
    }

    /// Snapshot of a task.
    #[must_use]
    pub fn get_task(&self, task_id: Uuid) -> Option<RelocationTask> {
        self.lock().get(&task_id).cloned()
    }

    /// Snapshot of every retained task, oldest first.
    #[must_use]
    pub fn list_tasks(&self) -> Vec<RelocationTask> {
        let mut tasks: Vec<_> = self.lock().values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Evict terminal tasks finished before `now - retention`; returns how many.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.inner.retention).unwrap_or(chrono::Duration::MAX);
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, task| {
            task.status.is_active()
                || task
                    .finished_at
                    .is_none_or(|finished| now - finished < retention)
        });
        before - tasks.len()
    }

    /// Run [`Self::sweep`] every `interval` until the runtime shuts down.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = manager.sweep(Utc::now());
                if removed > 0 {
                    debug!(removed, "expired relocation tasks evicted");
                }
            }
        })
    }

    async fn run_task(&self, task_id: Uuid) {
        let Some(task) = self.mark_running(task_id) else {
            return;
        };
        self.publish_queue_depth();
        let outcome = self.relocate(&task).await.map_err(|err| describe(&err));
        if let Err(message) = &outcome {
            warn!(task_id = %task_id, inventory_id = %task.inventory_id, error = %message, "relocation failed");
        }
        self.finish(task_id, outcome);
    }

    async fn relocate(&self, task: &RelocationTask) -> EngineResult<()> {
        let plan = self.prepare(task).await?;
        let transfer = self.transfer(task.id, &plan).await;
        if let Err(err) = transfer {
            self.restore_active(&plan.entry).await;
            self.note_failure(&plan, &err).await;
            return Err(err);
        }

        if let Err(err) = self.commit_relocation(&plan).await {
            error!(
                task_id = %task.id,
                destination = %plan.destination.display(),
                error = %err,
                "relocation bookkeeping failed; moving file back"
            );
            self.roll_back_transfer(&plan).await;
            self.restore_active(&plan.entry).await;
            return Err(err);
        }

        if let Some(record) = &plan.record
            && record.operation_mode == OperationMode::Symlink
        {
            self.retarget_symlink(&record.original_path, &plan.destination)
                .await;
        }
        info!(
            task_id = %task.id,
            inventory_id = %task.inventory_id,
            destination = %plan.destination.display(),
            target = %plan.target.name,
            "file relocated"
        );
        Ok(())
    }

    async fn prepare(&self, task: &RelocationTask) -> EngineResult<Plan> {
        let mut tx = self.inner.store.begin().await?;
        let entry = tx
            .get_inventory(task.inventory_id)
            .await?
            .ok_or_else(|| EngineError::not_found("inventory", task.inventory_id))?;
        let source = tx
            .get_location(task.source_location_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cold_location", task.source_location_id))?;
        let target = tx
            .get_location(task.target_location_id)
            .await?
            .ok_or_else(|| EngineError::not_found("cold_location", task.target_location_id))?;
        let path = tx
            .get_path(entry.path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("monitored_path", entry.path_id))?;
        let record = tx.find_record_by_cold_path(&entry.file_path).await?;

        if entry.cold_location_id != Some(source.id) || entry.status != FileStatus::Active {
            tx.rollback().await?;
            return Err(EngineError::invalid(
                "inventory",
                "changed_since_queued",
                entry.id,
            ));
        }
        let relative = entry
            .file_path
            .strip_prefix(&source.path)
            .map_err(|_| {
                EngineError::invalid("file_path", "outside_location", entry.file_path.display())
            })?
            .to_path_buf();
        let destination = target.path.join(relative);
        if fs::symlink_metadata(&destination).is_ok() {
            tx.rollback().await?;
            return Err(EngineError::DestinationExists { path: destination });
        }

        let migrating = FileInventoryEntry {
            status: FileStatus::Migrating,
            ..entry.clone()
        };
        tx.upsert_inventory(&migrating).await?;
        tx.commit().await?;
        Ok(Plan {
            entry,
            path,
            source,
            target,
            record,
            destination,
        })
    }

    async fn transfer(&self, task_id: Uuid, plan: &Plan) -> EngineResult<u64> {
        let manager = self.clone();
        let mover = self.inner.mover.clone();
        let payload = Payload::between(plan.source.is_encrypted, plan.target.is_encrypted);
        let (source, destination) = (plan.entry.file_path.clone(), plan.destination.clone());
        let unindexed = plan.path.prevent_indexing.then(|| plan.target.path.clone());
        tokio::task::spawn_blocking(move || -> EngineResult<u64> {
            let mut report = |bytes: u64| manager.record_bytes(task_id, bytes);
            let outcome =
                mover.transfer(&source, &destination, OperationMode::Move, payload, &mut report)?;
            if let Some(root) = &unindexed {
                suppress_indexing(root, &destination);
            }
            Ok(outcome.bytes)
        })
        .await
        .map_err(|err| EngineError::join("relocation.transfer", err))?
    }

    async fn commit_relocation(&self, plan: &Plan) -> EngineResult<()> {
        let now = Utc::now();
        let relocated = FileInventoryEntry {
            file_path: plan.destination.clone(),
            cold_location_id: Some(plan.target.id),
            status: FileStatus::Active,
            last_seen: now,
            ..plan.entry.clone()
        };
        let mut tx = self.inner.store.begin().await?;
        if let Some(adopted) = tx.find_inventory(plan.path.id, &plan.destination).await?
            && adopted.id != plan.entry.id
        {
            tx.delete_inventory(adopted.id).await?;
        }
        tx.upsert_inventory(&relocated).await?;
        match &plan.record {
            Some(record) => {
                let updated = FileRecord {
                    cold_storage_path: plan.destination.clone(),
                    cold_location_id: Some(plan.target.id),
                    timestamp: now,
                    ..record.clone()
                };
                tx.update_record(&updated).await?;
            }
            None => {
                let relative = plan
                    .entry
                    .file_path
                    .strip_prefix(&plan.source.path)
                    .unwrap_or(&plan.entry.file_path);
                let record = FileRecord {
                    id: Uuid::new_v4(),
                    path_id: plan.path.id,
                    original_path: plan.path.source_path.join(relative),
                    cold_storage_path: plan.destination.clone(),
                    cold_location_id: Some(plan.target.id),
                    file_size: plan.entry.file_size,
                    operation_mode: plan.path.operation_mode,
                    criteria_matched: Vec::new(),
                    timestamp: now,
                };
                tx.insert_record(&record).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn roll_back_transfer(&self, plan: &Plan) {
        let mover = self.inner.mover.clone();
        let payload = Payload::between(plan.target.is_encrypted, plan.source.is_encrypted);
        let (moved, original) = (plan.destination.clone(), plan.entry.file_path.clone());
        let result = tokio::task::spawn_blocking(move || {
            mover.transfer(&moved, &original, OperationMode::Move, payload, &mut |_| {})
        })
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(file = %plan.destination.display(), error = %err, "failed to move relocated file back");
            }
            Err(err) => error!(error = %err, "relocation rollback task aborted"),
        }
    }

    async fn restore_active(&self, entry: &FileInventoryEntry) {
        let restored = FileInventoryEntry {
            status: FileStatus::Active,
            ..entry.clone()
        };
        let write = async {
            let mut tx = self.inner.store.begin().await?;
            tx.upsert_inventory(&restored).await?;
            tx.commit().await
        };
        if let Err(err) = write.await {
            error!(inventory_id = %entry.id, error = %err, "failed to restore inventory status after relocation");
        }
    }

    async fn note_failure(&self, plan: &Plan, err: &EngineError) {
        let failure = OperationFailure {
            id: Uuid::new_v4(),
            location_id: plan.target.id,
            path_id: Some(plan.path.id),
            file_path: plan.entry.file_path.clone(),
            occurred_at: Utc::now(),
            message: describe(err),
        };
        let write = async {
            let mut tx = self.inner.store.begin().await?;
            tx.record_failure(&failure).await?;
            tx.commit().await
        };
        if let Err(store_err) = write.await {
            warn!(location = %plan.target.name, error = %store_err, "failed to record operation failure");
        }
    }

    async fn retarget_symlink(&self, link: &Path, destination: &Path) {
        let (link, destination) = (link.to_path_buf(), destination.to_path_buf());
        let result = tokio::task::spawn_blocking(move || {
            remove_symlink(&link)?;
            create_symlink(&destination, &link)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to retarget symlink after relocation"),
            Err(err) => warn!(error = %err, "symlink retarget task aborted"),
        }
    }

    fn mark_running(&self, task_id: Uuid) -> Option<RelocationTask> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(&task_id)?;
        if task.status != RelocationStatus::Pending {
            return None;
        }
        task.status = RelocationStatus::Running;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    fn record_bytes(&self, task_id: Uuid, bytes: u64) {
        if let Some(task) = self.lock().get_mut(&task_id) {
            task.bytes_done = bytes;
        }
    }

    fn finish(&self, task_id: Uuid, outcome: Result<(), String>) {
        let status = {
            let mut tasks = self.lock();
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            task.finished_at = Some(Utc::now());
            match outcome {
                Ok(()) => {
                    task.status = RelocationStatus::Completed;
                    task.bytes_done = task.bytes_total;
                }
                Err(message) => {
                    task.status = RelocationStatus::Failed;
                    task.error = Some(message);
                }
            }
            task.status
        };
        self.inner.metrics.inc_relocation(status.as_str());
        self.publish_queue_depth();
    }

    fn publish_queue_depth(&self) {
        let pending = self
            .lock()
            .values()
            .filter(|task| task.status == RelocationStatus::Pending)
            .count();
        self.inner.metrics.set_relocation_queue_depth(pending);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RelocationTask>> {
        lock_or_recover(&self.inner.tasks, "relocation tasks")
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(lock = name, "mutex poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierkeep_data::MemoryStore;

    fn manager() -> anyhow::Result<RelocationManager> {
        Ok(RelocationManager::new(
            Arc::new(MemoryStore::new()),
            FileMover::default(),
            Metrics::new()?,
            &RelocationSettings::default(),
        ))
    }

    fn terminal(manager: &RelocationManager, status: RelocationStatus, age: chrono::Duration) -> Uuid {
        let now = Utc::now();
        let task = RelocationTask {
            id: Uuid::new_v4(),
            inventory_id: Uuid::new_v4(),
            source_location_id: Uuid::new_v4(),
            source_location_name: "a".into(),
            target_location_id: Uuid::new_v4(),
            target_location_name: "b".into(),
            status,
            bytes_total: 1,
            bytes_done: 0,
            created_at: now - age,
            started_at: None,
            finished_at: (!status.is_active()).then_some(now - age),
            error: None,
        };
        manager.lock().insert(task.id, task.clone());
        task.id
    }

    #[test]
    fn sweep_keeps_active_and_recent_tasks() -> anyhow::Result<()> {
        let manager = manager()?;
        let old = terminal(&manager, RelocationStatus::Completed, chrono::Duration::hours(2));
        let recent = terminal(&manager, RelocationStatus::Failed, chrono::Duration::minutes(5));
        let pending = terminal(&manager, RelocationStatus::Pending, chrono::Duration::hours(5));

        assert_eq!(manager.sweep(Utc::now()), 1);
        assert!(manager.get_task(old).is_none());
        assert!(manager.get_task(recent).is_some());
        assert!(manager.get_task(pending).is_some());
        Ok(())
    }

    #[test]
    fn finish_records_terminal_state() -> anyhow::Result<()> {
        let manager = manager()?;
        let id = terminal(&manager, RelocationStatus::Running, chrono::Duration::zero());
        manager.finish(id, Err("disk full".into()));
        let task = manager.get_task(id).ok_or_else(|| anyhow::anyhow!("task evicted"))?;
        assert_eq!(task.status, RelocationStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("disk full"));
        assert!(task.finished_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn worker_can_only_start_once() -> anyhow::Result<()> {
        let manager = manager()?;
        let handle = manager.spawn_worker()?;
        assert!(matches!(
            manager.spawn_worker(),
            Err(EngineError::InvalidInput { field: "relocation_worker", .. })
        ));
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn unknown_inventory_is_not_found() -> anyhow::Result<()> {
        let manager = manager()?;
        let err = manager
            .create_task(Uuid::new_v4(), Uuid::new_v4())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert!(matches!(err, EngineError::NotFound { entity: "inventory", .. }));
        Ok(())
    }
}
