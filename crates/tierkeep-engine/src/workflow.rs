//! Per-path scan orchestration.
//!
//! # Design
//! - `process_path` claims the path through the progress manager, checks that the
//!   path is scannable, then runs cleanup, scan and inventory sync, thaws, freezes,
//!   and symlink reconciliation. A failure in one step is collected, never fatal.
//! - Store transactions are short: reads are committed before any filesystem work
//!   and results are written back in a fresh transaction.
//! - Filesystem walks and transfers run on the blocking pool.
//! - Both trees are walked: the hot source and every available cold location of the
//!   path. Cold files without a history record are adopted as cold inventory unless
//!   another path already tracks them.
//! - Cold rows keep the status-change time captured while the file was hot, so a
//!   rename into cold storage never makes a `ctime` rule thaw it again.
//! - Thaws always run before freezes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tierkeep_config::ScanSettings;
use tierkeep_data::{
    ColdStorageLocation, Criterion, CriterionType, FileInventoryEntry, FileRecord, FileStatus,
    InventoryFilter, MonitoredPath, OperationMode, ScanOutcome, StorageTier, Store,
};
use tierkeep_fsops::{FileMover, FileSnapshot, create_symlink, remove_symlink};
use tierkeep_telemetry::Metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::criteria::CriteriaMatcher;
use crate::error::{EngineError, EngineResult};
use crate::pool::run_bounded;
use crate::progress::{ScanCounter, ScanProgressManager, ScanStatus};
use crate::routing::StorageRouter;

/// Whether a filesystem reports trustworthy access times.
pub trait AccessTimeCapability: Send + Sync {
    /// `false` when atime under `root` cannot be relied on (e.g. network mounts).
    fn supports_access_time(&self, root: &Path) -> bool;
}

/// Treats every filesystem as atime-capable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeSupported;

impl AccessTimeCapability for AssumeSupported {
    fn supports_access_time(&self, _root: &Path) -> bool {
        true
    }
}

/// Aggregate outcome of one `process_path` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Scan identifier (the running scan's id when skipped).
    pub scan_id: Uuid,
    /// Another scan of the path was already running.
    pub scan_skipped: bool,
    /// Hot and cold files observed.
    pub files_found: u64,
    /// Files frozen.
    pub files_moved: u64,
    /// Files thawed.
    pub files_thawed: u64,
    /// Stale inventory and history rows removed.
    pub files_cleaned: u64,
    /// Files left alone (pinned, vanished, or no capacity).
    pub files_skipped: u64,
    /// Hot-side symlinks recreated.
    pub symlinks_repaired: u64,
    /// Per-file and per-step failures.
    pub errors: Vec<String>,
}

/// Why a file operation was not carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The source disappeared between scan and processing.
    SourceVanished,
    /// No cold location could take the file.
    NoCapacity,
}

/// Result of one file operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The operation finished.
    Completed {
        /// Plaintext bytes transferred.
        bytes: u64,
    },
    /// The operation was not attempted or was abandoned without error.
    Skipped {
        /// File concerned.
        file_path: PathBuf,
        /// Reason.
        reason: SkipReason,
    },
    /// The operation failed.
    Failed {
        /// File concerned.
        file_path: PathBuf,
        /// Error description.
        message: String,
    },
}

impl FileOutcome {
    pub(crate) fn from_result(file_path: &Path, result: EngineResult<u64>) -> Self {
        match result {
            Ok(bytes) => Self::Completed { bytes },
            Err(err) if err.is_source_missing() => Self::Skipped {
                file_path: file_path.to_path_buf(),
                reason: SkipReason::SourceVanished,
            },
            Err(EngineError::NoCapacity { .. }) => Self::Skipped {
                file_path: file_path.to_path_buf(),
                reason: SkipReason::NoCapacity,
            },
            Err(err) => Self::Failed {
                file_path: file_path.to_path_buf(),
                message: describe(&err),
            },
        }
    }

    pub(crate) fn panicked(file_path: PathBuf, err: &tokio::task::JoinError) -> Self {
        Self::Failed {
            file_path,
            message: format!("operation aborted: {err}"),
        }
    }
}

/// Collaborators of the workflow.
pub struct WorkflowDeps {
    /// Repository.
    pub store: Arc<dyn Store>,
    /// Cold location selection.
    pub router: StorageRouter,
    /// Physical transfers.
    pub mover: FileMover,
    /// Progress and scan exclusion.
    pub progress: ScanProgressManager,
    /// Rule evaluation.
    pub matcher: CriteriaMatcher,
    /// Access-time feasibility probe.
    pub capability: Arc<dyn AccessTimeCapability>,
    /// Metrics sink.
    pub metrics: Metrics,
    /// Scan tuning.
    pub settings: ScanSettings,
}

/// Drives scans, freezes, thaws, pins and reversals.
#[derive(Clone)]
pub struct FileWorkflow {
    pub(crate) inner: Arc<WorkflowDeps>,
}

impl std::fmt::Debug for FileWorkflow {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("FileWorkflow")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Everything a scan reads from the store up front.
pub(crate) struct ScanContext {
    pub(crate) path: MonitoredPath,
    pub(crate) criteria: Vec<Criterion>,
    pub(crate) locations: Vec<ColdStorageLocation>,
    pub(crate) pins: HashSet<PathBuf>,
}

impl ScanContext {
    pub(crate) fn enabled_criteria_ids(&self) -> Vec<Uuid> {
        self.criteria
            .iter()
            .filter(|criterion| criterion.enabled)
            .map(|criterion| criterion.id)
            .collect()
    }
}

/// Files observed on disk in one pass.
#[derive(Debug, Default)]
struct Observation {
    hot_files: Vec<FileSnapshot>,
    cold_files: Vec<(FileRecord, FileSnapshot)>,
    untracked_cold: Vec<(Uuid, FileSnapshot)>,
    unreachable: HashSet<Uuid>,
    errors: Vec<String>,
}

impl Observation {
    fn len(&self) -> usize {
        self.hot_files.len() + self.cold_files.len() + self.untracked_cold.len()
    }
}

/// Inventory state returned by a sync.
#[derive(Debug, Default)]
struct Synced {
    hot_rows: HashMap<PathBuf, FileInventoryEntry>,
    cold_changed: HashMap<PathBuf, DateTime<Utc>>,
}

/// Classification of observed files.
#[derive(Debug, Default)]
struct Plan {
    to_hot: Vec<FileRecord>,
    to_cold: Vec<FileInventoryEntry>,
    skipped: u64,
}

impl FileWorkflow {
    /// Build a workflow from its collaborators.
    #[must_use]
    pub fn new(deps: WorkflowDeps) -> Self {
        Self {
            inner: Arc::new(deps),
        }
    }

    /// Progress manager shared with pollers.
    #[must_use]
    pub fn progress(&self) -> &ScanProgressManager {
        &self.inner.progress
    }

    /// Scan one monitored path and apply its rules.
    ///
    /// Returns `scan_skipped = true` without touching anything when a scan of the path
    /// is already running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown path and
    /// [`EngineError::PathInError`] when the path fails its feasibility check; every
    /// other failure is collected into [`ScanResult::errors`].
    pub async fn process_path(&self, path_id: Uuid) -> EngineResult<ScanResult> {
        let progress = &self.inner.progress;
        let (scan_id, started) = progress.start_scan(path_id);
        if !started {
            info!(path_id = %path_id, scan_id = %scan_id, "scan already running; skipping");
            self.inner.metrics.inc_scan(ScanOutcome::Skipped.as_str());
            return Ok(ScanResult {
                scan_id,
                scan_skipped: true,
                ..ScanResult::default()
            });
        }

        self.inner.metrics.scan_started();
        let outcome = self.run_scan(path_id, scan_id).await;
        self.inner.metrics.scan_finished();

        let (status, scan_outcome) = match &outcome {
            Ok(_) => (ScanStatus::Completed, ScanOutcome::Completed),
            Err(_) => (ScanStatus::Failed, ScanOutcome::Failed),
        };
        if let Err(err) = &outcome {
            progress.add_error(path_id, describe(err));
        }
        if !matches!(outcome, Err(EngineError::NotFound { .. })) {
            self.record_outcome(path_id, scan_outcome).await;
        }
        progress.finish_scan(path_id, status);
        self.inner.metrics.inc_scan(scan_outcome.as_str());

        match &outcome {
            Ok(result) => info!(
                path_id = %path_id,
                found = result.files_found,
                moved = result.files_moved,
                thawed = result.files_thawed,
                cleaned = result.files_cleaned,
                skipped = result.files_skipped,
                errors = result.errors.len(),
                "scan completed"
            ),
            Err(err) => warn!(path_id = %path_id, error = %err, "scan failed"),
        }
        outcome
    }

    async fn run_scan(&self, path_id: Uuid, scan_id: Uuid) -> EngineResult<ScanResult> {
        let ctx = self.load_context(path_id).await?;
        self.check_feasibility(&ctx).await?;

        let mut result = ScanResult {
            scan_id,
            ..ScanResult::default()
        };

        match self.cleanup(&ctx).await {
            Ok(cleaned) => result.files_cleaned = cleaned,
            Err(err) => self.collect(&mut result, path_id, "cleanup", &err),
        }

        let plan = match self.scan_and_sync(&ctx, &mut result).await {
            Ok(plan) => plan,
            Err(err) => {
                self.collect(&mut result, path_id, "scan", &err);
                Plan::default()
            }
        };
        result.files_skipped += plan.skipped;

        let ctx = Arc::new(ctx);
        self.execute_thaws(&ctx, plan.to_hot, &mut result).await;
        self.execute_freezes(&ctx, plan.to_cold, &mut result).await;

        if ctx.path.operation_mode == OperationMode::Symlink {
            match self.reconcile_symlinks(&ctx).await {
                Ok(repaired) => result.symlinks_repaired = repaired,
                Err(err) => self.collect(&mut result, path_id, "reconcile", &err),
            }
        }
        Ok(result)
    }

    pub(crate) async fn load_context(&self, path_id: Uuid) -> EngineResult<ScanContext> {
        let mut tx = self.inner.store.begin().await?;
        let path = tx
            .get_path(path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("monitored_path", path_id))?;
        let criteria = tx.list_criteria(path_id).await?;
        let locations = tx.list_path_locations(path_id).await?;
        let pins = tx
            .list_pins(path_id)
            .await?
            .into_iter()
            .map(|pin| pin.file_path)
            .collect();
        tx.commit().await?;
        Ok(ScanContext {
            path,
            criteria,
            locations,
            pins,
        })
    }

    async fn check_feasibility(&self, ctx: &ScanContext) -> EngineResult<()> {
        let problem = self.feasibility_problem(ctx);
        if problem.is_none() && ctx.path.error_message.is_none() {
            return Ok(());
        }

        let mut tx = self.inner.store.begin().await?;
        tx.set_path_error(ctx.path.id, problem.as_deref()).await?;
        tx.commit().await?;

        match problem {
            Some(message) => {
                warn!(path_id = %ctx.path.id, error = %message, "monitored path is not scannable");
                Err(EngineError::PathInError {
                    path_id: ctx.path.id,
                    message,
                })
            }
            None => {
                info!(path_id = %ctx.path.id, "cleared standing path error");
                Ok(())
            }
        }
    }

    fn feasibility_problem(&self, ctx: &ScanContext) -> Option<String> {
        let source = &ctx.path.source_path;
        if !source.exists() {
            return Some(format!("source directory does not exist: {}", source.display()));
        }
        if !source.is_dir() {
            return Some(format!("source path is not a directory: {}", source.display()));
        }
        let needs_atime = ctx
            .criteria
            .iter()
            .any(|criterion| criterion.enabled && criterion.criterion_type == CriterionType::Atime);
        if needs_atime && !self.inner.capability.supports_access_time(source) {
            return Some(
                "access times are unreliable on this filesystem; disable atime criteria"
                    .to_string(),
            );
        }
        None
    }

    /// Remove history rows whose cold file is gone, collapse duplicate history rows,
    /// and drop inventory rows still absent one cycle after being marked missing.
    async fn cleanup(&self, ctx: &ScanContext) -> EngineResult<u64> {
        let path_id = ctx.path.id;
        let mut tx = self.inner.store.begin().await?;
        let records = tx.list_records(path_id).await?;
        let inventory = tx.query_inventory(&InventoryFilter::for_path(path_id)).await?;
        tx.commit().await?;

        let (stale_records, stale_inventory) = tokio::task::spawn_blocking(move || {
            let migrating: HashSet<PathBuf> = inventory
                .iter()
                .filter(|entry| entry.status == FileStatus::Migrating)
                .map(|entry| entry.file_path.clone())
                .collect();
            let mut newest: HashMap<PathBuf, (DateTime<Utc>, Uuid)> = HashMap::new();
            let mut stale_records = Vec::new();
            for record in &records {
                if migrating.contains(&record.cold_storage_path) {
                    continue;
                }
                if fs::symlink_metadata(&record.cold_storage_path).is_err() {
                    stale_records.push(record.id);
                    continue;
                }
                match newest.get_mut(&record.original_path) {
                    Some(kept) if kept.0 >= record.timestamp => stale_records.push(record.id),
                    Some(kept) => {
                        stale_records.push(kept.1);
                        *kept = (record.timestamp, record.id);
                    }
                    None => {
                        newest.insert(record.original_path.clone(), (record.timestamp, record.id));
                    }
                }
            }
            let stale_inventory: Vec<Uuid> = inventory
                .iter()
                .filter(|entry| entry.status == FileStatus::Missing)
                .filter(|entry| fs::symlink_metadata(&entry.file_path).is_err())
                .map(|entry| entry.id)
                .collect();
            (stale_records, stale_inventory)
        })
        .await
        .map_err(|err| EngineError::join("scan.cleanup", err))?;

        if stale_records.is_empty() && stale_inventory.is_empty() {
            return Ok(0);
        }
        let mut tx = self.inner.store.begin().await?;
        let mut cleaned = 0;
        for id in &stale_records {
            if tx.delete_record(*id).await? {
                cleaned += 1;
            }
        }
        for id in &stale_inventory {
            if tx.delete_inventory(*id).await? {
                cleaned += 1;
            }
        }
        tx.commit().await?;
        debug!(path_id = %path_id, cleaned, "stale rows removed");
        Ok(cleaned)
    }

    async fn scan_and_sync(&self, ctx: &ScanContext, result: &mut ScanResult) -> EngineResult<Plan> {
        let path_id = ctx.path.id;
        let mut tx = self.inner.store.begin().await?;
        let records = tx.list_records(path_id).await?;
        tx.commit().await?;

        let source = ctx.path.source_path.clone();
        let cold_roots: Vec<(Uuid, PathBuf)> = ctx
            .locations
            .iter()
            .filter(|location| location.is_available)
            .map(|location| (location.id, location.path.clone()))
            .collect();
        let ignored = self.inner.settings.ignored_names.clone();
        let observation = tokio::task::spawn_blocking(move || {
            observe(&source, &cold_roots, &ignored, records)
        })
        .await
        .map_err(|err| EngineError::join("scan.walk", err))?;

        for message in &observation.errors {
            warn!(path_id = %path_id, error = %message, "scan walk error");
        }
        result.errors.extend(observation.errors.iter().cloned());
        let found = observation.len() as u64;
        result.files_found = found;
        self.inner.progress.set_total(path_id, found);

        let synced = self.sync_inventory(ctx, &observation).await?;
        Ok(self.classify(ctx, &observation, synced))
    }

    /// Upsert every observed file and mark unobserved active rows missing. Rows on a
    /// location that could not be walked are left alone.
    async fn sync_inventory(&self, ctx: &ScanContext, observation: &Observation) -> EngineResult<Synced> {
        let path_id = ctx.path.id;
        let now = Utc::now();
        let mut tx = self.inner.store.begin().await?;
        let existing: HashMap<PathBuf, FileInventoryEntry> = tx
            .query_inventory(&InventoryFilter::for_path(path_id))
            .await?
            .into_iter()
            .map(|entry| (entry.file_path.clone(), entry))
            .collect();

        let mut observed = HashSet::new();
        let mut synced = Synced::default();
        for snapshot in &observation.hot_files {
            let previous = existing.get(&snapshot.path);
            let entry = inventory_entry(path_id, snapshot, previous, now, StorageTier::Hot, None);
            let stored = tx.upsert_inventory(&entry).await?;
            observed.insert(snapshot.path.clone());
            synced.hot_rows.insert(snapshot.path.clone(), stored);
        }
        for (record, snapshot) in &observation.cold_files {
            let previous = existing.get(&record.cold_storage_path);
            let mut entry = cold_entry(path_id, snapshot, previous, now, record.cold_location_id);
            entry.file_size = record.file_size;
            tx.upsert_inventory(&entry).await?;
            observed.insert(record.cold_storage_path.clone());
            synced
                .cold_changed
                .insert(record.cold_storage_path.clone(), entry.changed_at);
        }

        if !observation.untracked_cold.is_empty() {
            let claimed: HashSet<PathBuf> = tx
                .query_inventory(&InventoryFilter::default().with_tier(StorageTier::Cold))
                .await?
                .into_iter()
                .filter(|entry| entry.path_id != path_id)
                .map(|entry| entry.file_path)
                .collect();
            let mut adopted = 0_u64;
            for (location_id, snapshot) in &observation.untracked_cold {
                if claimed.contains(&snapshot.path) {
                    continue;
                }
                if let Some(owner) = tx.find_record_by_cold_path(&snapshot.path).await?
                    && owner.path_id != path_id
                {
                    continue;
                }
                let previous = existing.get(&snapshot.path);
                let entry = cold_entry(path_id, snapshot, previous, now, Some(*location_id));
                tx.upsert_inventory(&entry).await?;
                observed.insert(snapshot.path.clone());
                if previous.is_none() {
                    adopted += 1;
                }
            }
            if adopted > 0 {
                info!(path_id = %path_id, adopted, "untracked cold files added to inventory");
            }
        }

        let vanished: Vec<Uuid> = existing
            .values()
            .filter(|entry| entry.status == FileStatus::Active && !observed.contains(&entry.file_path))
            .filter(|entry| {
                entry.storage_tier == StorageTier::Hot
                    || !entry
                        .cold_location_id
                        .is_some_and(|id| observation.unreachable.contains(&id))
            })
            .map(|entry| entry.id)
            .collect();
        if !vanished.is_empty() {
            let marked = tx.bulk_update_status(&vanished, FileStatus::Missing).await?;
            debug!(path_id = %path_id, marked, "unobserved inventory rows marked missing");
        }
        tx.commit().await?;
        Ok(synced)
    }

    fn classify(&self, ctx: &ScanContext, observation: &Observation, mut synced: Synced) -> Plan {
        let now = Utc::now();
        let matcher = &self.inner.matcher;
        let progress = &self.inner.progress;
        let path_id = ctx.path.id;
        let mut plan = Plan::default();

        let with_cold_copy: HashSet<&Path> = observation
            .cold_files
            .iter()
            .map(|(record, _)| record.original_path.as_path())
            .collect();

        for snapshot in &observation.hot_files {
            progress.increment(path_id, ScanCounter::Processed);
            if ctx.pins.contains(&snapshot.path) {
                plan.skipped += 1;
                progress.increment(path_id, ScanCounter::Skipped);
                continue;
            }
            if with_cold_copy.contains(snapshot.path.as_path()) {
                continue;
            }
            if matcher.evaluate(snapshot, None, &ctx.criteria, now).keep_in_hot {
                continue;
            }
            if let Some(entry) = synced.hot_rows.remove(&snapshot.path) {
                plan.to_cold.push(entry);
            }
        }

        for (record, snapshot) in &observation.cold_files {
            progress.increment(path_id, ScanCounter::Processed);
            if ctx.pins.contains(&record.original_path) {
                plan.skipped += 1;
                progress.increment(path_id, ScanCounter::Skipped);
                continue;
            }
            let mut file = snapshot.clone();
            file.path.clone_from(&record.original_path);
            file.size = record.file_size;
            if let Some(changed) = synced.cold_changed.get(&record.cold_storage_path) {
                file.changed = *changed;
            }
            if matcher.evaluate(&file, None, &ctx.criteria, now).keep_in_hot {
                plan.to_hot.push(record.clone());
            }
        }
        for _ in &observation.untracked_cold {
            progress.increment(path_id, ScanCounter::Processed);
        }
        debug!(
            path_id = %path_id,
            to_cold = plan.to_cold.len(),
            to_hot = plan.to_hot.len(),
            "files classified"
        );
        plan
    }

    async fn execute_thaws(&self, ctx: &Arc<ScanContext>, records: Vec<FileRecord>, result: &mut ScanResult) {
        let workflow = self.clone();
        let context = Arc::clone(ctx);
        let thaw = move |record: FileRecord| {
            let workflow = workflow.clone();
            let context = Arc::clone(&context);
            async move {
                let original = record.original_path.clone();
                let outcome = workflow
                    .thaw_record(&context.path, record)
                    .await
                    .map(|entry| entry.file_size);
                FileOutcome::from_result(&original, outcome)
            }
        };
        let outcomes = run_bounded(records, self.inner.settings.thaw_workers, thaw, |record, err| {
            FileOutcome::panicked(record.original_path, &err)
        })
        .await;
        self.tally(ctx.path.id, outcomes, ScanCounter::MovedToHot, result);
    }

    async fn execute_freezes(
        &self,
        ctx: &Arc<ScanContext>,
        entries: Vec<FileInventoryEntry>,
        result: &mut ScanResult,
    ) {
        let workflow = self.clone();
        let context = Arc::clone(ctx);
        let freeze = move |entry: FileInventoryEntry| {
            let workflow = workflow.clone();
            let context = Arc::clone(&context);
            async move {
                let file_path = entry.file_path.clone();
                let criteria_ids = context.enabled_criteria_ids();
                let outcome = workflow
                    .freeze_entry(&context.path, entry, criteria_ids)
                    .await
                    .map(|record| record.file_size);
                FileOutcome::from_result(&file_path, outcome)
            }
        };
        let outcomes = run_bounded(entries, self.inner.settings.freeze_workers, freeze, |entry, err| {
            FileOutcome::panicked(entry.file_path, &err)
        })
        .await;
        self.tally(ctx.path.id, outcomes, ScanCounter::MovedToCold, result);
    }

    fn tally(&self, path_id: Uuid, outcomes: Vec<FileOutcome>, done: ScanCounter, result: &mut ScanResult) {
        let progress = &self.inner.progress;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Completed { .. } => {
                    progress.increment(path_id, done);
                    if done == ScanCounter::MovedToCold {
                        result.files_moved += 1;
                    } else {
                        result.files_thawed += 1;
                    }
                }
                FileOutcome::Skipped { file_path, reason } => {
                    debug!(path_id = %path_id, file = %file_path.display(), ?reason, "file skipped");
                    progress.increment(path_id, ScanCounter::Skipped);
                    result.files_skipped += 1;
                }
                FileOutcome::Failed { file_path, message } => {
                    let message = format!("{}: {message}", file_path.display());
                    progress.add_error(path_id, message.clone());
                    result.errors.push(message);
                }
            }
        }
    }

    /// Recreate missing or dangling hot-side symlinks whose cold payload still exists.
    async fn reconcile_symlinks(&self, ctx: &ScanContext) -> EngineResult<u64> {
        let path_id = ctx.path.id;
        let mut tx = self.inner.store.begin().await?;
        let records = tx.list_records(path_id).await?;
        tx.commit().await?;

        let repaired = tokio::task::spawn_blocking(move || {
            let mut repaired = 0;
            for record in records
                .iter()
                .filter(|record| record.operation_mode == OperationMode::Symlink)
            {
                match repair_symlink(&record.original_path, &record.cold_storage_path) {
                    Ok(true) => repaired += 1,
                    Ok(false) => {}
                    Err(err) => warn!(
                        path_id = %path_id,
                        file = %record.original_path.display(),
                        error = %err,
                        "failed to repair symlink"
                    ),
                }
            }
            repaired
        })
        .await
        .map_err(|err| EngineError::join("scan.reconcile", err))?;
        if repaired > 0 {
            info!(path_id = %path_id, repaired, "hot-side symlinks recreated");
        }
        Ok(repaired)
    }

    async fn record_outcome(&self, path_id: Uuid, outcome: ScanOutcome) {
        let write = async {
            let mut tx = self.inner.store.begin().await?;
            tx.record_scan_outcome(path_id, Utc::now(), outcome).await?;
            tx.commit().await
        };
        if let Err(err) = write.await {
            warn!(path_id = %path_id, error = %err, "failed to persist scan outcome");
        }
    }

    fn collect(&self, result: &mut ScanResult, path_id: Uuid, step: &'static str, err: &EngineError) {
        warn!(path_id = %path_id, step, error = %err, "scan step failed");
        let message = format!("{step}: {}", describe(err));
        self.inner.progress.add_error(path_id, message.clone());
        result.errors.push(message);
    }
}

/// Error text including the source chain.
pub(crate) fn describe(err: &EngineError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub(crate) fn inventory_entry(
    path_id: Uuid,
    snapshot: &FileSnapshot,
    previous: Option<&FileInventoryEntry>,
    now: DateTime<Utc>,
    tier: StorageTier,
    cold_location_id: Option<Uuid>,
) -> FileInventoryEntry {
    let status = match previous {
        Some(entry) if entry.status == FileStatus::Migrating => FileStatus::Migrating,
        _ => FileStatus::Active,
    };
    FileInventoryEntry {
        id: previous.map_or_else(Uuid::new_v4, |entry| entry.id),
        path_id,
        file_path: snapshot.path.clone(),
        storage_tier: tier,
        file_size: snapshot.size,
        modified_at: snapshot.modified,
        accessed_at: snapshot.accessed,
        changed_at: snapshot.changed,
        checksum: previous.and_then(|entry| entry.checksum.clone()),
        status,
        cold_location_id,
        last_seen: now,
    }
}

/// Cold inventory row for a file observed under a cold location. An existing row
/// keeps its status-change time.
fn cold_entry(
    path_id: Uuid,
    snapshot: &FileSnapshot,
    previous: Option<&FileInventoryEntry>,
    now: DateTime<Utc>,
    cold_location_id: Option<Uuid>,
) -> FileInventoryEntry {
    let mut entry = inventory_entry(path_id, snapshot, previous, now, StorageTier::Cold, cold_location_id);
    if let Some(previous) = previous {
        entry.changed_at = previous.changed_at;
    }
    entry
}

fn is_ignored(name: &str, ignored: &[String]) -> bool {
    name.starts_with('.') || ignored.iter().any(|candidate| candidate == name)
}

fn walk(root: &Path, ignored: &[String]) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| entry.depth() == 0 || !is_ignored(&entry.file_name().to_string_lossy(), ignored))
}

fn observe(
    source: &Path,
    cold_roots: &[(Uuid, PathBuf)],
    ignored: &[String],
    records: Vec<FileRecord>,
) -> Observation {
    let mut observation = Observation::default();
    let mut cold_links = Vec::new();
    for entry in walk(source, ignored) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                observation.errors.push(format!("walk: {err}"));
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => observation
                    .hot_files
                    .push(FileSnapshot::from_metadata(entry.path(), &metadata)),
                Err(err) => observation.errors.push(format!("{}: {err}", entry.path().display())),
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map(|target| {
                entry
                    .path()
                    .parent()
                    .map_or_else(|| target.clone(), |parent| parent.join(&target))
            });
            match target {
                Ok(target) if cold_roots.iter().any(|(_, root)| target.starts_with(root)) => {
                    cold_links.push(entry.path().to_path_buf());
                }
                Ok(_) => debug!(file = %entry.path().display(), "symlink outside cold storage ignored"),
                Err(err) => observation.errors.push(format!("{}: {err}", entry.path().display())),
            }
        }
    }

    let mut by_cold_path: HashMap<PathBuf, FileRecord> = records
        .into_iter()
        .map(|record| (record.cold_storage_path.clone(), record))
        .collect();
    let mut seen = HashSet::new();
    for (location_id, root) in cold_roots {
        if !root.is_dir() {
            debug!(root = %root.display(), "cold location not reachable; skipping walk");
            observation.unreachable.insert(*location_id);
            continue;
        }
        for entry in walk(root, ignored) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    observation.errors.push(format!("walk: {err}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() || !seen.insert(entry.path().to_path_buf()) {
                continue;
            }
            let snapshot = match entry.metadata() {
                Ok(metadata) => FileSnapshot::from_metadata(entry.path(), &metadata),
                Err(err) => {
                    observation.errors.push(format!("{}: {err}", entry.path().display()));
                    continue;
                }
            };
            match by_cold_path.remove(entry.path()) {
                Some(record) => observation.cold_files.push((record, snapshot)),
                None => observation.untracked_cold.push((*location_id, snapshot)),
            }
        }
    }

    for record in by_cold_path.into_values() {
        if record
            .cold_location_id
            .is_some_and(|id| observation.unreachable.contains(&id))
        {
            continue;
        }
        match FileSnapshot::follow(&record.cold_storage_path) {
            Ok(snapshot) => observation.cold_files.push((record, snapshot)),
            Err(err) if err.is_source_missing() => {
                debug!(file = %record.cold_storage_path.display(), "cold file missing");
            }
            Err(err) => observation
                .errors
                .push(format!("{}: {err}", record.cold_storage_path.display())),
        }
    }

    let tracked: HashSet<&Path> = observation
        .cold_files
        .iter()
        .map(|(record, _)| record.original_path.as_path())
        .collect();
    for link in cold_links.iter().filter(|link| !tracked.contains(link.as_path())) {
        debug!(file = %link.display(), "untracked symlink into cold storage left in place");
    }
    observation
}

fn repair_symlink(link: &Path, target: &Path) -> tierkeep_fsops::FsOpsResult<bool> {
    if fs::metadata(target).is_err() {
        return Ok(false);
    }
    match fs::symlink_metadata(link) {
        Err(_) => {
            create_symlink(target, link)?;
            Ok(true)
        }
        Ok(metadata) if metadata.file_type().is_symlink() => {
            if fs::metadata(link).is_ok() {
                return Ok(false);
            }
            remove_symlink(link)?;
            create_symlink(target, link)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierkeep_test_support::fixtures::TierFixture;

    #[test]
    fn walk_skips_dot_files_and_ignored_names() -> anyhow::Result<()> {
        let fixture = TierFixture::new(1)?;
        fixture.write_hot("keep/a.txt", b"a")?;
        fixture.write_hot(".hidden/b.txt", b"b")?;
        fixture.write_hot(".DS_Store", b"c")?;
        fixture.write_hot("Thumbs.db", b"d")?;
        fixture.write_hot("keep/.swp", b"e")?;

        let ignored = ScanSettings::default().ignored_names;
        let roots = [(Uuid::new_v4(), fixture.cold(0).to_path_buf())];
        let observation = observe(fixture.hot(), &roots, &ignored, Vec::new());
        let names: Vec<String> = observation.hot_files.iter().map(FileSnapshot::file_name).collect();
        assert_eq!(names, vec!["a.txt".to_string()]);
        assert!(observation.errors.is_empty());
        Ok(())
    }

    #[test]
    fn cold_walk_splits_recorded_and_untracked_files() -> anyhow::Result<()> {
        let fixture = TierFixture::new(2)?;
        let recorded = fixture.cold(0).join("shows/a.mkv");
        let untracked = fixture.cold(0).join("shows/b.mkv");
        for file in [&recorded, &untracked] {
            tierkeep_test_support::fixtures::write_file(file, b"payload")?;
        }
        tierkeep_test_support::fixtures::write_file(&fixture.cold(0).join(".a.mkv.part"), b"temp")?;
        let record = FileRecord {
            id: Uuid::new_v4(),
            path_id: Uuid::new_v4(),
            original_path: fixture.hot().join("shows/a.mkv"),
            cold_storage_path: recorded.clone(),
            cold_location_id: None,
            file_size: 7,
            operation_mode: OperationMode::Move,
            criteria_matched: Vec::new(),
            timestamp: Utc::now(),
        };
        let (reachable, offline) = (Uuid::new_v4(), Uuid::new_v4());
        fs::remove_dir_all(fixture.cold(1))?;
        let roots = [
            (reachable, fixture.cold(0).to_path_buf()),
            (offline, fixture.cold(1).to_path_buf()),
        ];

        let observation = observe(fixture.hot(), &roots, &[], vec![record.clone()]);
        assert_eq!(observation.cold_files.len(), 1);
        assert_eq!(observation.cold_files[0].0.id, record.id);
        assert_eq!(observation.untracked_cold.len(), 1);
        assert_eq!(observation.untracked_cold[0].0, reachable);
        assert_eq!(observation.untracked_cold[0].1.path, untracked);
        assert!(observation.unreachable.contains(&offline));
        assert_eq!(observation.len(), 2);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlinks_are_repaired_but_files_are_not_replaced() -> anyhow::Result<()> {
        let fixture = TierFixture::new(1)?;
        let target = fixture.cold(0).join("a.bin");
        fs::write(&target, b"payload")?;

        let missing = fixture.hot().join("a.bin");
        assert!(repair_symlink(&missing, &target)?);
        assert_eq!(fs::read(&missing)?, b"payload");
        assert!(!repair_symlink(&missing, &target)?);

        let dangling = fixture.hot().join("b.bin");
        std::os::unix::fs::symlink(fixture.cold(0).join("nowhere"), &dangling)?;
        assert!(repair_symlink(&dangling, &target)?);
        assert_eq!(fs::read_link(&dangling)?, target);

        let occupied = fixture.write_hot("c.bin", b"user data")?;
        assert!(!repair_symlink(&occupied, &target)?);
        assert_eq!(fs::read(&occupied)?, b"user data");
        Ok(())
    }

    #[test]
    fn outcomes_map_errors_to_sentinels() {
        let file = Path::new("/srv/hot/a.txt");
        let vanished = FileOutcome::from_result(
            file,
            Err(EngineError::from(tierkeep_fsops::FsOpsError::SourceMissing {
                path: file.to_path_buf(),
            })),
        );
        assert!(matches!(
            vanished,
            FileOutcome::Skipped {
                reason: SkipReason::SourceVanished,
                ..
            }
        ));
        let full = FileOutcome::from_result(
            file,
            Err(EngineError::NoCapacity {
                file_path: file.to_path_buf(),
                size: 1,
            }),
        );
        assert!(matches!(
            full,
            FileOutcome::Skipped {
                reason: SkipReason::NoCapacity,
                ..
            }
        ));
        let failed = FileOutcome::from_result(
            file,
            Err(EngineError::DestinationExists {
                path: PathBuf::from("/mnt/cold/a.txt"),
            }),
        );
        assert!(matches!(failed, FileOutcome::Failed { .. }));
        assert_eq!(
            FileOutcome::from_result(file, Ok(3)),
            FileOutcome::Completed { bytes: 3 }
        );
    }
}
