//! Cold location selection.
//!
//! # Design
//! - Candidates are the path's associated locations in association order.
//! - Hard filters: availability, directory reachability, critical free-space
//!   percentage, the absolute free-space floor, and room for the file plus a buffer.
//! - Survivors are scored by free space (sub-linear, capped at 50), load (linear in
//!   files already routed, 30 down to 0 at saturation), minus a penalty per recent
//!   failure. The highest score wins; ties keep input order.

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tierkeep_config::RoutingSettings;
use tierkeep_data::{ColdStorageLocation, MonitoredPath, OperationMode, Store};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

const SPACE_SCORE_MAX: f64 = 50.0;
const SPACE_SCORE_SLOPE: f64 = 5.0;
const LOAD_SCORE_MAX: f64 = 30.0;
const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// Free and total bytes on the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes available to unprivileged writers.
    pub available: u64,
    /// Filesystem capacity.
    pub total: u64,
}

impl DiskUsage {
    /// Free space as a percentage of capacity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn free_percent(self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available as f64 / self.total as f64 * 100.0
    }
}

/// Disk usage lookup per mount.
pub trait DiskUsageProbe: Send + Sync {
    /// Usage of the filesystem that holds `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the filesystem cannot be queried.
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// Disk usage via `statvfs`/`GetDiskFreeSpaceEx`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2DiskUsage;

impl DiskUsageProbe for Fs2DiskUsage {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        Ok(DiskUsage {
            available: fs2::available_space(path)?,
            total: fs2::total_space(path)?,
        })
    }
}

/// Store-derived inputs for scoring one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocationLoad {
    /// Inventory rows already stored on the location.
    pub routed_files: u64,
    /// Failures recorded against the location inside the error window.
    pub recent_errors: u64,
}

/// Reason a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Marked unavailable.
    Unavailable,
    /// Missing, not a directory, or usage could not be read.
    Unreachable,
    /// Free percentage at or below the critical threshold.
    Critical,
    /// Below the absolute free-space floor.
    BelowFloor,
    /// Not enough room for the file plus buffer.
    TooSmall,
}

/// Picks a cold location for a file.
#[derive(Clone)]
pub struct StorageRouter {
    store: Arc<dyn Store>,
    probe: Arc<dyn DiskUsageProbe>,
    settings: RoutingSettings,
}

impl std::fmt::Debug for StorageRouter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StorageRouter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl StorageRouter {
    /// Router over `store` using `probe` for disk usage.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, probe: Arc<dyn DiskUsageProbe>, settings: RoutingSettings) -> Self {
        Self {
            store,
            probe,
            settings,
        }
    }

    /// Choose the best location for a file of `file_size` bytes under `path`.
    ///
    /// Returns `Ok(None)` when no candidate passes the thresholds. Encrypted locations are
    /// never offered to symlink-mode paths.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store cannot be read.
    pub async fn select_location(
        &self,
        path: &MonitoredPath,
        file_size: u64,
    ) -> EngineResult<Option<ColdStorageLocation>> {
        let window = ChronoDuration::from_std(self.settings.error_window()).map_err(|_| {
            EngineError::invalid(
                "routing.error_window_secs",
                "out_of_range",
                self.settings.error_window_secs,
            )
        })?;
        let since = Utc::now() - window;

        let mut tx = self.store.begin().await?;
        let locations = tx.list_path_locations(path.id).await?;
        let mut candidates = Vec::with_capacity(locations.len());
        for location in locations {
            if location.is_encrypted && path.operation_mode == OperationMode::Symlink {
                warn!(
                    path_id = %path.id,
                    location = %location.name,
                    "encrypted location skipped for symlink-mode path"
                );
                continue;
            }
            let load = LocationLoad {
                routed_files: tx.count_inventory_for_location(location.id).await?,
                recent_errors: tx.count_failures_since(location.id, since).await?,
            };
            candidates.push((location, load));
        }
        tx.commit().await?;

        let probe = Arc::clone(&self.probe);
        let settings = self.settings.clone();
        let path_id = path.id;
        tokio::task::spawn_blocking(move || {
            pick(&candidates, probe.as_ref(), &settings, file_size, path_id).cloned()
        })
        .await
        .map_err(|err| EngineError::join("routing.select_location", err))
    }

    /// Score a candidate, or explain why it is excluded.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the location cannot take the file.
    pub fn score(
        &self,
        location: &ColdStorageLocation,
        load: LocationLoad,
        file_size: u64,
    ) -> Result<f64, Rejection> {
        score_candidate(location, load, self.probe.as_ref(), &self.settings, file_size)
    }
}

fn pick<'a>(
    candidates: &'a [(ColdStorageLocation, LocationLoad)],
    probe: &dyn DiskUsageProbe,
    settings: &RoutingSettings,
    file_size: u64,
    path_id: Uuid,
) -> Option<&'a ColdStorageLocation> {
    let mut best: Option<(&ColdStorageLocation, f64)> = None;
    for (location, load) in candidates {
        match score_candidate(location, *load, probe, settings, file_size) {
            Ok(score) => {
                debug!(location = %location.name, score, "routing candidate scored");
                if best.is_none_or(|(_, top)| score > top) {
                    best = Some((location, score));
                }
            }
            Err(reason) => {
                debug!(location = %location.name, ?reason, "routing candidate rejected");
            }
        }
    }
    if best.is_none() {
        warn!(path_id = %path_id, file_size, "no cold location can accept file");
    }
    best.map(|(location, _)| location)
}

#[allow(clippy::cast_precision_loss)]
fn score_candidate(
    location: &ColdStorageLocation,
    load: LocationLoad,
    probe: &dyn DiskUsageProbe,
    settings: &RoutingSettings,
    file_size: u64,
) -> Result<f64, Rejection> {
    if !location.is_available {
        return Err(Rejection::Unavailable);
    }
    if !location.path.is_dir() {
        return Err(Rejection::Unreachable);
    }
    let usage = probe.usage(&location.path).map_err(|err| {
        warn!(location = %location.name, error = %err, "disk usage query failed");
        Rejection::Unreachable
    })?;

    let free_percent = usage.free_percent();
    if free_percent <= location.critical_threshold_percent {
        return Err(Rejection::Critical);
    }
    if free_percent <= location.caution_threshold_percent {
        warn!(
            location = %location.name,
            free_percent,
            "cold location free space below caution threshold"
        );
    }
    if usage.available < settings.min_free_bytes {
        return Err(Rejection::BelowFloor);
    }
    if usage.available < file_size.saturating_add(settings.buffer_bytes) {
        return Err(Rejection::TooSmall);
    }

    let free_gib = usage.available as f64 / BYTES_PER_GIB;
    let space = (free_gib.sqrt() * SPACE_SCORE_SLOPE).min(SPACE_SCORE_MAX);
    let saturation = settings.load_saturation_files.max(1) as f64;
    let routed = (load.routed_files as f64).min(saturation);
    let load_score = LOAD_SCORE_MAX * (1.0 - routed / saturation);
    let penalty = f64::from(settings.error_penalty) * load.recent_errors as f64;
    Ok(space + load_score - penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const GIB: u64 = 1 << 30;

    #[derive(Default)]
    struct FixedUsage {
        by_path: Mutex<HashMap<PathBuf, DiskUsage>>,
    }

    impl FixedUsage {
        fn set(&self, path: &Path, available: u64, total: u64) {
            if let Ok(mut guard) = self.by_path.lock() {
                guard.insert(path.to_path_buf(), DiskUsage { available, total });
            }
        }
    }

    impl DiskUsageProbe for FixedUsage {
        fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
            self.by_path
                .lock()
                .ok()
                .and_then(|guard| guard.get(path).copied())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn location(dir: &TempDir, name: &str) -> std::io::Result<ColdStorageLocation> {
        let path = dir.path().join(name);
        std::fs::create_dir_all(&path)?;
        Ok(ColdStorageLocation::new(name, path))
    }

    #[test]
    fn scoring_prefers_space_and_penalises_errors() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let probe = FixedUsage::default();
        let settings = RoutingSettings::default();
        let roomy = location(&dir, "roomy")?;
        let small = location(&dir, "small")?;
        probe.set(&roomy.path, 400 * GIB, 1000 * GIB);
        probe.set(&small.path, 4 * GIB, 10 * GIB);

        let roomy_score = score_candidate(&roomy, LocationLoad::default(), &probe, &settings, 1024)
            .map_err(|reason| anyhow::anyhow!("{reason:?}"))?;
        assert!((roomy_score - 80.0).abs() < f64::EPSILON);
        let small_score = score_candidate(&small, LocationLoad::default(), &probe, &settings, 1024)
            .map_err(|reason| anyhow::anyhow!("{reason:?}"))?;
        assert!((small_score - 40.0).abs() < 1e-9);

        let failing = LocationLoad {
            routed_files: 5_000,
            recent_errors: 2,
        };
        let penalised = score_candidate(&roomy, failing, &probe, &settings, 1024)
            .map_err(|reason| anyhow::anyhow!("{reason:?}"))?;
        assert!((penalised - (50.0 + 15.0 - 20.0)).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn hard_filters_reject_candidates() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let probe = FixedUsage::default();
        let settings = RoutingSettings::default();

        let critical = location(&dir, "critical")?;
        probe.set(&critical.path, 5 * GIB, 100 * GIB);
        assert_eq!(
            score_candidate(&critical, LocationLoad::default(), &probe, &settings, 1),
            Err(Rejection::Critical)
        );

        let mut offline = location(&dir, "offline")?;
        offline.is_available = false;
        assert_eq!(
            score_candidate(&offline, LocationLoad::default(), &probe, &settings, 1),
            Err(Rejection::Unavailable)
        );

        let floor = location(&dir, "floor")?;
        probe.set(&floor.path, 50 * 1024 * 1024, 100 * 1024 * 1024);
        assert_eq!(
            score_candidate(&floor, LocationLoad::default(), &probe, &settings, 1),
            Err(Rejection::BelowFloor)
        );

        let tight = location(&dir, "tight")?;
        probe.set(&tight.path, 2 * GIB, 4 * GIB);
        assert_eq!(
            score_candidate(&tight, LocationLoad::default(), &probe, &settings, 2 * GIB),
            Err(Rejection::TooSmall)
        );

        let gone = ColdStorageLocation::new("gone", dir.path().join("missing"));
        assert_eq!(
            score_candidate(&gone, LocationLoad::default(), &probe, &settings, 1),
            Err(Rejection::Unreachable)
        );
        Ok(())
    }

    #[test]
    fn ties_keep_input_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let probe = FixedUsage::default();
        let first = location(&dir, "first")?;
        let second = location(&dir, "second")?;
        probe.set(&first.path, 100 * GIB, 200 * GIB);
        probe.set(&second.path, 100 * GIB, 200 * GIB);
        let candidates = vec![
            (first.clone(), LocationLoad::default()),
            (second, LocationLoad::default()),
        ];
        let chosen = pick(&candidates, &probe, &RoutingSettings::default(), 1, Uuid::nil());
        assert_eq!(chosen.map(|location| location.id), Some(first.id));
        Ok(())
    }
}
