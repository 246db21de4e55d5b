//! Default values for configuration sections.
//!
//! # Design
//! - Keep every tunable default in one place so documentation and tests agree.

/// Maximum concurrent thaw operations inside one scan.
pub const THAW_WORKERS: usize = 3;
/// Maximum concurrent freeze operations inside one scan.
pub const FREEZE_WORKERS: usize = 5;
/// Retention window for terminal scan progress records.
pub const PROGRESS_RETENTION_SECS: u64 = 300;
/// Interval between progress sweeps.
pub const PROGRESS_SWEEP_INTERVAL_SECS: u64 = 60;
/// Maximum in-flight file operations kept per scan for UI polling.
pub const MAX_FILE_OPERATIONS: usize = 5;
/// Retention window for terminal relocation tasks.
pub const RELOCATION_RETENTION_SECS: u64 = 3_600;
/// Interval between relocation sweeps.
pub const RELOCATION_SWEEP_INTERVAL_SECS: u64 = 300;
/// Absolute free-space floor a cold location must keep.
pub const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;
/// Extra headroom required on top of the file being routed.
pub const BUFFER_BYTES: u64 = 1024 * 1024;
/// Window in which failed operations penalise a location.
pub const ERROR_WINDOW_SECS: u64 = 900;
/// Score penalty applied per recent failure.
pub const ERROR_PENALTY: u32 = 10;
/// File count at which the load score bottoms out.
pub const LOAD_SATURATION_FILES: u64 = 10_000;
/// Default location of the per-instance encryption secret.
pub const KEY_FILE: &str = "tierkeep.key";
/// Default scheduler tick.
pub const SCHEDULER_TICK_SECS: u64 = 30;
/// Default log level.
pub const LOG_LEVEL: &str = "info";

/// Names skipped during scans on top of every dot-prefixed entry.
pub const IGNORED_NAMES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "$RECYCLE.BIN",
    "System Volume Information",
    "lost+found",
];
