//! Error types for the data access layer.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Result alias for data layer operations.
pub type DataResult<T> = Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug, Error)]
pub enum DataError {
    /// Migration execution failed.
    #[error("migration failed")]
    MigrationFailed {
        /// Underlying migration error.
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    #[error("database operation failed")]
    QueryFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// A path could not be represented as UTF-8.
    #[error("path contained invalid utf-8")]
    PathNotUtf8 {
        /// Field name that contained the invalid path.
        field: &'static str,
        /// Path value.
        path: PathBuf,
    },
    /// A stored value could not be decoded into its domain type.
    #[error("stored value could not be decoded")]
    Decode {
        /// Field that held the value.
        field: &'static str,
        /// Raw stored value.
        value: String,
    },
    /// An update targeted a row that does not exist.
    #[error("entity not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier that was looked up.
        id: Uuid,
    },
}

impl DataError {
    pub(crate) const fn query(operation: &'static str, source: sqlx::Error) -> Self {
        Self::QueryFailed { operation, source }
    }

    pub(crate) fn decode(field: &'static str, value: impl Into<String>) -> Self {
        Self::Decode {
            field,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn data_error_display_and_source() {
        let query = DataError::query("fetch", sqlx::Error::RowNotFound);
        assert_eq!(query.to_string(), "database operation failed");
        assert!(query.source().is_some());

        let path = DataError::PathNotUtf8 {
            field: "file_path",
            path: PathBuf::from("/srv/hot/a.txt"),
        };
        assert_eq!(path.to_string(), "path contained invalid utf-8");
        assert!(path.source().is_none());

        let decode = DataError::decode("status", "frozen");
        assert!(matches!(
            decode,
            DataError::Decode { field: "status", ref value } if value == "frozen"
        ));
    }
}
