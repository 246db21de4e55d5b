//! # Design
//!
//! - Constant-message errors for file transfer and encryption.
//! - Context (operation, path, field) lives in fields, never in the message.
//! - Integrity failures are distinct from IO so callers can tell tampering from disk trouble.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by the file mover and encryption service.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The transfer destination is already occupied.
    #[error("fsops destination exists")]
    DestinationExists {
        /// Occupied destination.
        path: PathBuf,
    },
    /// The transfer source disappeared.
    #[error("fsops source missing")]
    SourceMissing {
        /// Missing source.
        path: PathBuf,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// An encrypted payload requires a key that was not configured.
    #[error("fsops encryption unavailable")]
    EncryptionUnavailable,
    /// Key material could not be loaded or derived.
    #[error("fsops key material failure")]
    KeyMaterial {
        /// Key file involved.
        path: PathBuf,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// An encrypted file is shorter than its fixed header and trailer.
    #[error("fsops malformed encrypted file")]
    Malformed {
        /// File that was rejected.
        path: PathBuf,
        /// Observed length in bytes.
        length: u64,
    },
    /// Authentication tag verification failed.
    #[error("fsops integrity check failed")]
    Integrity {
        /// File that failed verification.
        path: PathBuf,
    },
    /// User lookup failed when resolving an owner.
    #[error("fsops user lookup failed")]
    UserLookup {
        /// Username that failed lookup.
        user: String,
        /// Underlying nix error.
        source: nix::Error,
    },
    /// Group lookup failed when resolving a group.
    #[error("fsops group lookup failed")]
    GroupLookup {
        /// Group name that failed lookup.
        group: String,
        /// Underlying nix error.
        source: nix::Error,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: &'static str, value: &str) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value: Some(value.to_string()),
        }
    }

    /// Whether the failure means the source vanished before or during the operation.
    #[must_use]
    pub fn is_source_missing(&self) -> bool {
        match self {
            Self::SourceMissing { .. } => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn io_errors_keep_context_out_of_message() {
        let err = FsOpsError::io(
            "transfer.rename",
            "/srv/hot/a.txt",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(err.to_string(), "fsops io failure");
        assert!(err.source().is_some());
        assert!(err.is_source_missing());
    }

    #[test]
    fn integrity_is_not_source_missing() {
        let err = FsOpsError::Integrity {
            path: PathBuf::from("/mnt/cold/a.txt"),
        };
        assert_eq!(err.to_string(), "fsops integrity check failed");
        assert!(!err.is_source_missing());
    }
}
