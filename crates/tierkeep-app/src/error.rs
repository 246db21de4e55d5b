//! # Design
//!
//! - Centralize application-level errors for bootstrap and scheduling.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: tierkeep_config::ConfigError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: tierkeep_telemetry::TelemetryError,
    },
    /// Store operations failed.
    #[error("store operation failed")]
    Data {
        /// Operation identifier.
        operation: &'static str,
        /// Source data error.
        source: tierkeep_data::DataError,
    },
    /// Database connection failed.
    #[error("database connection failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source SQL error.
        source: sqlx::Error,
    },
    /// Filesystem setup failed.
    #[error("filesystem setup failed")]
    FsOps {
        /// Operation identifier.
        operation: &'static str,
        /// Source fsops error.
        source: tierkeep_fsops::FsOpsError,
    },
    /// Engine operations failed.
    #[error("engine operation failed")]
    Engine {
        /// Operation identifier.
        operation: &'static str,
        /// Source engine error.
        source: tierkeep_engine::EngineError,
    },
    /// Waiting for the shutdown signal failed.
    #[error("shutdown signal failed")]
    Signal {
        /// Source IO error.
        source: std::io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: tierkeep_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: tierkeep_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn data(operation: &'static str, source: tierkeep_data::DataError) -> Self {
        Self::Data { operation, source }
    }

    pub(crate) const fn fsops(
        operation: &'static str,
        source: tierkeep_fsops::FsOpsError,
    ) -> Self {
        Self::FsOps { operation, source }
    }

    pub(crate) const fn engine(
        operation: &'static str,
        source: tierkeep_engine::EngineError,
    ) -> Self {
        Self::Engine { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn helpers_build_variants() {
        let data = AppError::data(
            "store.begin",
            tierkeep_data::DataError::NotFound {
                entity: "monitored_path",
                id: Uuid::nil(),
            },
        );
        assert!(matches!(data, AppError::Data { operation: "store.begin", .. }));

        let fsops = AppError::fsops(
            "encryption.key_file",
            tierkeep_fsops::FsOpsError::KeyMaterial {
                path: PathBuf::from("tierkeep.key"),
                reason: "secret_too_short",
            },
        );
        assert!(matches!(fsops, AppError::FsOps { .. }));

        let engine = AppError::engine(
            "relocation.spawn_worker",
            tierkeep_engine::EngineError::RelocationConflict {
                inventory_id: Uuid::nil(),
            },
        );
        assert_eq!(engine.to_string(), "engine operation failed");
    }
}
