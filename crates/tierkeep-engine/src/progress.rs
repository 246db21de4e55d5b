//! In-memory scan progress and per-path scan exclusion.
//!
//! # Design
//! - One coarse lock guards all records; every critical section is a short map update.
//! - `start_scan` is the only way to claim a path, so at most one scan per path runs.
//! - Terminal records linger for the retention window so pollers can read final counters.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tierkeep_config::ProgressSettings;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Scan in progress.
    Running,
    /// Scan finished.
    Completed,
    /// Scan aborted.
    Failed,
}

impl ScanStatus {
    /// Whether the scan has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Kind of file operation shown in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationKind {
    /// Hot to cold.
    Freeze,
    /// Cold to hot.
    Thaw,
}

/// One in-flight file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOperationProgress {
    /// File being processed.
    pub file_path: PathBuf,
    /// Direction.
    pub kind: FileOperationKind,
    /// Bytes copied so far.
    pub bytes_done: u64,
    /// Bytes expected.
    pub bytes_total: u64,
    /// When the operation began.
    pub started_at: DateTime<Utc>,
}

/// Snapshot of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    /// Scan identifier.
    pub scan_id: Uuid,
    /// Monitored path identifier.
    pub path_id: Uuid,
    /// Lifecycle state.
    pub status: ScanStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time once terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Files discovered.
    pub total_files: u64,
    /// Files examined.
    pub processed: u64,
    /// Files frozen.
    pub moved_to_cold: u64,
    /// Files thawed.
    pub moved_to_hot: u64,
    /// Files skipped.
    pub skipped: u64,
    /// Most recent in-flight operations, oldest first.
    pub current_operations: VecDeque<FileOperationProgress>,
    /// Errors collected so far.
    pub errors: Vec<String>,
}

/// Counter to bump on a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCounter {
    /// A file was examined.
    Processed,
    /// A file was frozen.
    MovedToCold,
    /// A file was thawed.
    MovedToHot,
    /// A file was skipped.
    Skipped,
}

#[derive(Debug, Default)]
struct ProgressState {
    by_path: HashMap<Uuid, ScanProgress>,
    path_by_scan: HashMap<Uuid, Uuid>,
}

/// Tracks scan progress for UI polling and enforces one scan per path.
#[derive(Debug, Clone)]
pub struct ScanProgressManager {
    state: Arc<Mutex<ProgressState>>,
    retention: Duration,
    max_operations: usize,
}

impl ScanProgressManager {
    /// Manager using the configured retention and operation window.
    #[must_use]
    pub fn new(settings: &ProgressSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState::default())),
            retention: settings.retention(),
            max_operations: settings.max_file_operations.max(1),
        }
    }

    /// Claim `path_id` for a scan. Returns the scan id and whether this call claimed it;
    /// `false` means a scan is already running and the returned id is that scan's.
    pub fn start_scan(&self, path_id: Uuid) -> (Uuid, bool) {
        let mut state = self.lock();
        if let Some(existing) = state.by_path.get(&path_id)
            && existing.status == ScanStatus::Running
        {
            return (existing.scan_id, false);
        }
        let scan_id = Uuid::new_v4();
        let previous = state.by_path.insert(
            path_id,
            ScanProgress {
                scan_id,
                path_id,
                status: ScanStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                total_files: 0,
                processed: 0,
                moved_to_cold: 0,
                moved_to_hot: 0,
                skipped: 0,
                current_operations: VecDeque::new(),
                errors: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            state.path_by_scan.remove(&previous.scan_id);
        }
        state.path_by_scan.insert(scan_id, path_id);
        drop(state);
        debug!(path_id = %path_id, scan_id = %scan_id, "scan started");
        (scan_id, true)
    }

    /// Record the number of files discovered.
    pub fn set_total(&self, path_id: Uuid, total: u64) {
        self.update(path_id, |scan| scan.total_files = total);
    }

    /// Increment one counter.
    pub fn increment(&self, path_id: Uuid, counter: ScanCounter) {
        self.update(path_id, |scan| match counter {
            ScanCounter::Processed => scan.processed += 1,
            ScanCounter::MovedToCold => scan.moved_to_cold += 1,
            ScanCounter::MovedToHot => scan.moved_to_hot += 1,
            ScanCounter::Skipped => scan.skipped += 1,
        });
    }

    /// Append an error message.
    pub fn add_error(&self, path_id: Uuid, message: impl Into<String>) {
        let message = message.into();
        self.update(path_id, |scan| scan.errors.push(message));
    }

    /// Register an in-flight operation, evicting the oldest when the window is full.
    pub fn begin_operation(
        &self,
        path_id: Uuid,
        file_path: &Path,
        kind: FileOperationKind,
        bytes_total: u64,
    ) {
        let max = self.max_operations;
        self.update(path_id, |scan| {
            while scan.current_operations.len() >= max {
                scan.current_operations.pop_front();
            }
            scan.current_operations.push_back(FileOperationProgress {
                file_path: file_path.to_path_buf(),
                kind,
                bytes_done: 0,
                bytes_total,
                started_at: Utc::now(),
            });
        });
    }

    /// Update byte progress of an in-flight operation.
    pub fn update_operation(&self, path_id: Uuid, file_path: &Path, bytes_done: u64) {
        self.update(path_id, |scan| {
            if let Some(operation) = scan
                .current_operations
                .iter_mut()
                .find(|operation| operation.file_path == file_path)
            {
                operation.bytes_done = bytes_done;
            }
        });
    }

    /// Drop an operation from the in-flight window.
    pub fn end_operation(&self, path_id: Uuid, file_path: &Path) {
        self.update(path_id, |scan| {
            scan.current_operations
                .retain(|operation| operation.file_path != file_path);
        });
    }

    /// Mark the scan terminal and release the path.
    pub fn finish_scan(&self, path_id: Uuid, status: ScanStatus) {
        self.update(path_id, |scan| {
            scan.status = status;
            scan.finished_at = Some(Utc::now());
            scan.current_operations.clear();
        });
        debug!(path_id = %path_id, ?status, "scan finished");
    }

    /// Progress for a path.
    #[must_use]
    pub fn get(&self, path_id: Uuid) -> Option<ScanProgress> {
        self.lock().by_path.get(&path_id).cloned()
    }

    /// Progress by scan id.
    #[must_use]
    pub fn get_by_scan(&self, scan_id: Uuid) -> Option<ScanProgress> {
        let state = self.lock();
        state
            .path_by_scan
            .get(&scan_id)
            .and_then(|path_id| state.by_path.get(path_id))
            .filter(|scan| scan.scan_id == scan_id)
            .cloned()
    }

    /// Scans currently running.
    #[must_use]
    pub fn active(&self) -> Vec<ScanProgress> {
        self.lock()
            .by_path
            .values()
            .filter(|scan| scan.status == ScanStatus::Running)
            .cloned()
            .collect()
    }

    /// Evict terminal records finished before `now - retention`; returns how many.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let mut state = self.lock();
        let expired: Vec<(Uuid, Uuid)> = state
            .by_path
            .values()
            .filter(|scan| {
                scan.status.is_terminal()
                    && scan
                        .finished_at
                        .is_some_and(|finished| now - finished >= retention)
            })
            .map(|scan| (scan.path_id, scan.scan_id))
            .collect();
        for (path_id, scan_id) in &expired {
            state.by_path.remove(path_id);
            state.path_by_scan.remove(scan_id);
        }
        expired.len()
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
                    debug!(removed, "expired scan progress evicted");
                }
            }
        })
    }

    fn update(&self, path_id: Uuid, apply: impl FnOnce(&mut ScanProgress)) {
        if let Some(scan) = self.lock().by_path.get_mut(&path_id) {
            apply(scan);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("scan progress mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> ScanProgressManager {
        ScanProgressManager::new(&ProgressSettings::default())
    }

    #[test]
    fn concurrent_starts_yield_one_winner() {
        let manager = manager();
        let path_id = Uuid::new_v4();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || manager.start_scan(path_id).1)
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .filter(|started| *started)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn finished_scan_releases_the_path() {
        let manager = manager();
        let path_id = Uuid::new_v4();
        let (first, started) = manager.start_scan(path_id);
        assert!(started);
        assert_eq!(manager.start_scan(path_id), (first, false));

        manager.increment(path_id, ScanCounter::MovedToCold);
        manager.add_error(path_id, "permission denied");
        manager.finish_scan(path_id, ScanStatus::Completed);
        let done = manager.get_by_scan(first);
        assert_eq!(done.as_ref().map(|scan| scan.moved_to_cold), Some(1));
        assert_eq!(done.map(|scan| scan.errors.len()), Some(1));

        let (second, started) = manager.start_scan(path_id);
        assert!(started);
        assert_ne!(first, second);
        assert!(manager.get_by_scan(first).is_none());
    }

    #[test]
    fn operation_window_is_bounded() {
        let manager = ScanProgressManager::new(&ProgressSettings {
            max_file_operations: 2,
            ..ProgressSettings::default()
        });
        let path_id = Uuid::new_v4();
        manager.start_scan(path_id);
        for name in ["a", "b", "c"] {
            manager.begin_operation(path_id, Path::new(name), FileOperationKind::Freeze, 10);
        }
        manager.update_operation(path_id, Path::new("c"), 7);
        let scan = manager.get(path_id);
        let operations: Vec<_> = scan
            .map(|scan| scan.current_operations.into_iter().collect())
            .unwrap_or_default();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0].file_path, PathBuf::from("b"));
        assert_eq!(operations[1].bytes_done, 7);

        manager.end_operation(path_id, Path::new("b"));
        assert_eq!(manager.get(path_id).map(|scan| scan.current_operations.len()), Some(1));
    }

    #[test]
    fn sweep_evicts_only_expired_terminal_scans() {
        let manager = manager();
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();
        manager.start_scan(done);
        manager.start_scan(running);
        manager.finish_scan(done, ScanStatus::Failed);

        assert_eq!(manager.sweep(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(manager.sweep(later), 1);
        assert!(manager.get(done).is_none());
        assert_eq!(manager.active().len(), 1);
    }
}
