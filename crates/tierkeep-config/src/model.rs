//! Configuration sections for the tiering engine.
//!
//! # Design
//! - Every section deserialises with defaults so partial documents are valid.
//! - Durations are stored as whole seconds and exposed through `Duration` accessors.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scan orchestration tuning.
    pub scan: ScanSettings,
    /// Progress tracker retention.
    pub progress: ProgressSettings,
    /// Relocation manager retention.
    pub relocation: RelocationSettings,
    /// Cold-location routing thresholds.
    pub routing: RoutingSettings,
    /// Encryption key material.
    pub encryption: EncryptionSettings,
    /// Periodic trigger used by the application binary.
    pub scheduler: SchedulerSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// `PostgreSQL` connection string; the in-memory store is used when absent.
    pub database_url: Option<String>,
}

/// Scan orchestration tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Upper bound for concurrent thaw operations.
    pub thaw_workers: usize,
    /// Upper bound for concurrent freeze operations.
    pub freeze_workers: usize,
    /// Pin files after an automatic freeze.
    pub pin_after_freeze: bool,
    /// Pin files after an automatic thaw.
    pub pin_after_thaw: bool,
    /// Compute a SHA-256 checksum for frozen files.
    pub compute_checksums: bool,
    /// Entry names skipped during traversal in addition to dot-files.
    pub ignored_names: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            thaw_workers: defaults::THAW_WORKERS,
            freeze_workers: defaults::FREEZE_WORKERS,
            pin_after_freeze: false,
            pin_after_thaw: false,
            compute_checksums: false,
            ignored_names: defaults::IGNORED_NAMES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }
}

/// Retention settings for the scan progress tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    /// Seconds a terminal scan record is kept.
    pub retention_secs: u64,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
    /// Size of the in-flight file operation window.
    pub max_file_operations: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            retention_secs: defaults::PROGRESS_RETENTION_SECS,
            sweep_interval_secs: defaults::PROGRESS_SWEEP_INTERVAL_SECS,
            max_file_operations: defaults::MAX_FILE_OPERATIONS,
        }
    }
}

impl ProgressSettings {
    /// Retention window as a duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Retention settings for relocation tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationSettings {
    /// Seconds a terminal task is kept.
    pub retention_secs: u64,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for RelocationSettings {
    fn default() -> Self {
        Self {
            retention_secs: defaults::RELOCATION_RETENTION_SECS,
            sweep_interval_secs: defaults::RELOCATION_SWEEP_INTERVAL_SECS,
        }
    }
}

impl RelocationSettings {
    /// Retention window as a duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Sweep interval as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Thresholds used when scoring cold locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Free space a location must retain regardless of file size.
    pub min_free_bytes: u64,
    /// Headroom added to the routed file size.
    pub buffer_bytes: u64,
    /// Window in which failed operations count against a location.
    pub error_window_secs: u64,
    /// Score penalty per recent failure.
    pub error_penalty: u32,
    /// Routed file count at which the load score reaches zero.
    pub load_saturation_files: u64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            min_free_bytes: defaults::MIN_FREE_BYTES,
            buffer_bytes: defaults::BUFFER_BYTES,
            error_window_secs: defaults::ERROR_WINDOW_SECS,
            error_penalty: defaults::ERROR_PENALTY,
            load_saturation_files: defaults::LOAD_SATURATION_FILES,
        }
    }
}

impl RoutingSettings {
    /// Failure window as a duration.
    #[must_use]
    pub const fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

/// Location of the per-instance secret used for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Path to the secret file; created on first use.
    pub key_file: PathBuf,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from(defaults::KEY_FILE),
        }
    }
}

/// Periodic trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between due-path checks.
    pub tick_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_secs: defaults::SCHEDULER_TICK_SECS,
        }
    }
}

impl SchedulerSettings {
    /// Tick interval as a duration.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

/// Log output format as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormatSetting {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Output format; inferred from the build profile when unset.
    pub format: Option<LogFormatSetting>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}
