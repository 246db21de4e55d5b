//! Error types for configuration operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// Reading the configuration file failed.
    #[error("failed to read configuration file")]
    Io {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Parsing the configuration document failed.
    #[error("failed to parse configuration document")]
    Parse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        field: &'static str,
        reason: &'static str,
        value: impl ToString,
    ) -> Self {
        Self::InvalidField {
            section,
            field,
            reason,
            value: Some(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_error_messages_stay_constant() {
        let err = ConfigError::invalid("scan", "freeze_workers", "must_be_positive", 0);
        assert_eq!(err.to_string(), "invalid configuration field");
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                section: "scan",
                field: "freeze_workers",
                ..
            }
        ));

        let io_err = ConfigError::Io {
            path: PathBuf::from("config.json"),
            source: io::Error::other("io"),
        };
        assert!(io_err.source().is_some());
    }
}
