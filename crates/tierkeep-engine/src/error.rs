//! # Design
//!
//! - Constant messages; identifiers and paths live in fields.
//! - Variants map onto the failure classes callers act on differently: sticky path
//!   errors, capacity shortfalls, integrity failures, and concurrency conflicts.

use std::path::PathBuf;

use thiserror::Error;
use tierkeep_data::DataError;
use tierkeep_fsops::FsOpsError;
use tokio::task::JoinError;
use uuid::Uuid;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by the tiering engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The monitored path carries a standing configuration error.
    #[error("monitored path is in an error state")]
    PathInError {
        /// Path identifier.
        path_id: Uuid,
        /// Stored error message.
        message: String,
    },
    /// No cold location can accept the file right now.
    #[error("no cold storage location has capacity")]
    NoCapacity {
        /// File that could not be placed.
        file_path: PathBuf,
        /// Bytes that needed placing.
        size: u64,
    },
    /// A relocation is already pending or running for the inventory entry.
    #[error("relocation already in progress")]
    RelocationConflict {
        /// Inventory entry identifier.
        inventory_id: Uuid,
    },
    /// A referenced entity does not exist.
    #[error("entity not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier or path that was looked up.
        id: String,
    },
    /// Caller supplied invalid input.
    #[error("invalid engine input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The computed destination is already occupied.
    #[error("destination already exists")]
    DestinationExists {
        /// Occupied destination.
        path: PathBuf,
    },
    /// Repository failure.
    #[error("store operation failed")]
    Data {
        /// Underlying store error.
        #[from]
        source: DataError,
    },
    /// Filesystem or encryption failure.
    #[error("filesystem operation failed")]
    FsOps {
        /// Underlying filesystem error.
        #[from]
        source: FsOpsError,
    },
    /// A blocking worker task panicked or was cancelled.
    #[error("background task failed")]
    Join {
        /// Operation the task was running.
        operation: &'static str,
        /// Underlying join error.
        source: JoinError,
    },
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: &'static str, value: impl ToString) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value: Some(value.to_string()),
        }
    }

    pub(crate) const fn join(operation: &'static str, source: JoinError) -> Self {
        Self::Join { operation, source }
    }

    /// Whether the failure was a decryption integrity check.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::FsOps {
                source: FsOpsError::Integrity { .. } | FsOpsError::Malformed { .. }
            }
        )
    }

    /// Whether the source file disappeared before it could be processed.
    #[must_use]
    pub fn is_source_missing(&self) -> bool {
        matches!(self, Self::FsOps { source } if source.is_source_missing())
    }

    /// Whether the failure is transient contention or capacity rather than a real fault.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoCapacity { .. } | Self::RelocationConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn messages_stay_constant() {
        let err = EngineError::NoCapacity {
            file_path: PathBuf::from("/srv/hot/a.bin"),
            size: 10,
        };
        assert_eq!(err.to_string(), "no cold storage location has capacity");
        assert!(err.is_retryable());

        let wrapped = EngineError::from(FsOpsError::Integrity {
            path: PathBuf::from("/mnt/cold/a.bin"),
        });
        assert!(wrapped.is_integrity());
        assert!(wrapped.source().is_some());
        assert!(!wrapped.is_retryable());
    }

    #[test]
    fn source_missing_is_detected_through_fsops() {
        let err = EngineError::from(FsOpsError::SourceMissing {
            path: PathBuf::from("/srv/hot/gone"),
        });
        assert!(err.is_source_missing());
        assert!(!EngineError::not_found("path", Uuid::nil()).is_source_missing());
    }
}
