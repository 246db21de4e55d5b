//! Validation rules applied after loading.

use crate::error::{ConfigError, ConfigResult};
use crate::model::EngineConfig;

/// Validate a fully merged configuration document.
///
/// # Errors
///
/// Returns the first [`ConfigError::InvalidField`] encountered.
pub fn validate(config: &EngineConfig) -> ConfigResult<()> {
    ensure_positive("scan", "thaw_workers", widen(config.scan.thaw_workers))?;
    ensure_positive("scan", "freeze_workers", widen(config.scan.freeze_workers))?;
    ensure_positive(
        "progress",
        "max_file_operations",
        widen(config.progress.max_file_operations),
    )?;
    ensure_positive("progress", "retention_secs", config.progress.retention_secs)?;
    ensure_positive(
        "progress",
        "sweep_interval_secs",
        config.progress.sweep_interval_secs,
    )?;
    ensure_positive(
        "relocation",
        "retention_secs",
        config.relocation.retention_secs,
    )?;
    ensure_positive(
        "relocation",
        "sweep_interval_secs",
        config.relocation.sweep_interval_secs,
    )?;
    ensure_positive(
        "routing",
        "error_window_secs",
        config.routing.error_window_secs,
    )?;
    ensure_positive(
        "routing",
        "load_saturation_files",
        config.routing.load_saturation_files,
    )?;
    ensure_positive("scheduler", "tick_secs", config.scheduler.tick_secs)?;

    if config.logging.level.trim().is_empty() {
        return Err(ConfigError::invalid("logging", "level", "empty", ""));
    }
    if config.encryption.key_file.as_os_str().is_empty() {
        return Err(ConfigError::invalid("encryption", "key_file", "empty", ""));
    }
    if let Some(url) = config.database_url.as_deref()
        && !(url.starts_with("postgres://") || url.starts_with("postgresql://"))
    {
        return Err(ConfigError::invalid(
            "database",
            "database_url",
            "unsupported_scheme",
            url,
        ));
    }
    Ok(())
}

fn widen(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn ensure_positive(section: &'static str, field: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(section, field, "must_be_positive", value));
    }
    Ok(())
}
