//! Configuration loading from a JSON document and `TIERKEEP_*` environment overrides.
//!
//! # Design
//! - File values are applied first, environment overrides second, validation last.
//! - Environment access goes through a lookup closure so tests never mutate the process env.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{EngineConfig, LogFormatSetting};
use crate::validate::validate;

/// Environment variable carrying the database URL.
pub const ENV_DATABASE_URL: &str = "TIERKEEP_DATABASE_URL";
/// Environment variable carrying the log level.
pub const ENV_LOG_LEVEL: &str = "TIERKEEP_LOG_LEVEL";
/// Environment variable carrying the log format.
pub const ENV_LOG_FORMAT: &str = "TIERKEEP_LOG_FORMAT";
/// Environment variable carrying the encryption key file path.
pub const ENV_KEY_FILE: &str = "TIERKEEP_KEY_FILE";
/// Environment variable carrying the freeze worker cap.
pub const ENV_FREEZE_WORKERS: &str = "TIERKEEP_FREEZE_WORKERS";
/// Environment variable carrying the thaw worker cap.
pub const ENV_THAW_WORKERS: &str = "TIERKEEP_THAW_WORKERS";
/// Environment variable pointing at the configuration file.
pub const ENV_CONFIG_FILE: &str = "TIERKEEP_CONFIG";

/// Loads [`EngineConfig`] documents.
pub struct ConfigLoader<F>
where
    F: Fn(&str) -> Option<String>,
{
    lookup: F,
}

impl ConfigLoader<fn(&str) -> Option<String>> {
    /// Loader reading overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            lookup: |key: &str| std::env::var(key).ok(),
        }
    }
}

impl<F> ConfigLoader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Loader reading overrides through the supplied lookup.
    pub const fn with_lookup(lookup: F) -> Self {
        Self { lookup }
    }

    /// Load configuration from `path` (or `TIERKEEP_CONFIG` when `None`), apply
    /// environment overrides, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, an override is malformed,
    /// or validation fails.
    pub fn load(&self, path: Option<&Path>) -> ConfigResult<EngineConfig> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| (self.lookup)(ENV_CONFIG_FILE).map(PathBuf::from));
        let mut config = match file {
            Some(file) => read_document(&file)?,
            None => EngineConfig::default(),
        };
        self.apply_overrides(&mut config)?;
        validate(&config)?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut EngineConfig) -> ConfigResult<()> {
        if let Some(url) = self.value(ENV_DATABASE_URL) {
            config.database_url = Some(url);
        }
        if let Some(level) = self.value(ENV_LOG_LEVEL) {
            config.logging.level = level;
        }
        if let Some(format) = self.value(ENV_LOG_FORMAT) {
            config.logging.format = Some(parse_log_format(&format)?);
        }
        if let Some(key_file) = self.value(ENV_KEY_FILE) {
            config.encryption.key_file = PathBuf::from(key_file);
        }
        if let Some(raw) = self.value(ENV_FREEZE_WORKERS) {
            config.scan.freeze_workers = parse_number("scan", "freeze_workers", &raw)?;
        }
        if let Some(raw) = self.value(ENV_THAW_WORKERS) {
            config.scan.thaw_workers = parse_number("scan", "thaw_workers", &raw)?;
        }
        Ok(())
    }

    fn value(&self, key: &str) -> Option<String> {
        let value = (self.lookup)(key)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        debug!(key, "applying configuration override");
        Some(trimmed.to_string())
    }
}

fn read_document(path: &Path) -> ConfigResult<EngineConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_log_format(value: &str) -> ConfigResult<LogFormatSetting> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormatSetting::Json),
        "pretty" => Ok(LogFormatSetting::Pretty),
        _ => Err(ConfigError::invalid(
            "logging",
            "format",
            "unknown_format",
            value,
        )),
    }
}

fn parse_number<T: FromStr>(
    section: &'static str,
    field: &'static str,
    value: &str,
) -> ConfigResult<T> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::invalid(section, field, "not_a_number", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn overrides_replace_defaults() -> ConfigResult<()> {
        let loader = ConfigLoader::with_lookup(lookup_from(&[
            (ENV_DATABASE_URL, "postgres://localhost/tierkeep"),
            (ENV_LOG_FORMAT, "JSON"),
            (ENV_FREEZE_WORKERS, "2"),
            (ENV_LOG_LEVEL, "  "),
        ]));
        let config = loader.load(None)?;
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/tierkeep")
        );
        assert_eq!(config.logging.format, Some(LogFormatSetting::Json));
        assert_eq!(config.scan.freeze_workers, 2);
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[test]
    fn malformed_worker_override_is_rejected() {
        let loader = ConfigLoader::with_lookup(lookup_from(&[(ENV_THAW_WORKERS, "many")]));
        assert!(matches!(
            loader.load(None),
            Err(ConfigError::InvalidField {
                field: "thaw_workers",
                reason: "not_a_number",
                ..
            })
        ));
    }

    #[test]
    fn zero_worker_override_fails_validation() {
        let loader = ConfigLoader::with_lookup(lookup_from(&[(ENV_FREEZE_WORKERS, "0")]));
        assert!(matches!(
            loader.load(None),
            Err(ConfigError::InvalidField {
                reason: "must_be_positive",
                ..
            })
        ));
    }
}
