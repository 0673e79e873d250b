//! Error types for DDR repository sync
//!
//! The variants follow the failure classes the scheduler has to tell apart:
//! transient external failures are retried on the next tick, lock contention is
//! routine, and an unavailable storage device ends the loop.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for DDR sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for DDR sync
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Transient external failures
    // ==========================================================================
    #[error("Access-control endpoint unavailable: {0}")]
    AccessUnavailable(String),

    #[error("Status command `{command}` failed with exit code {code}: {output}")]
    StatusCommand {
        command: String,
        code: i32,
        output: String,
    },

    // ==========================================================================
    // Storage
    // ==========================================================================
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    // ==========================================================================
    // Cached / persisted state
    // ==========================================================================
    #[error("Malformed state in {location}: {message}")]
    MalformedState { location: String, message: String },

    /// A batch write stopped part way. The listed files are already
    /// rewritten on disk and still have to be committed.
    #[error("Write failed after {} file(s) changed: {source}", .changed_files.len())]
    PartialWrite {
        child_ids: Vec<String>,
        changed_files: Vec<PathBuf>,
        source: Box<Error>,
    },

    // ==========================================================================
    // Coordination
    // ==========================================================================
    #[error("Lock busy: {0}")]
    LockBusy(String),

    // ==========================================================================
    // Validation
    // ==========================================================================
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ==========================================================================
    // I/O
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::MalformedState`].
    pub fn malformed(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedState {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Returns the error type string (for logs and JSON output)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::AccessUnavailable(_) => "ACCESS_UNAVAILABLE",
            Self::StatusCommand { .. } => "STATUS_COMMAND_FAILED",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::CollectionNotFound(_) => "NOT_FOUND",
            Self::MalformedState { .. } => "MALFORMED_STATE",
            Self::PartialWrite { .. } => "PARTIAL_WRITE",
            Self::LockBusy(_) => "LOCK_BUSY",
            Self::InvalidIdentifier(_) | Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Returns whether the error clears up on its own (retry next tick)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AccessUnavailable(_)
                | Self::StatusCommand { .. }
                | Self::MalformedState { .. }
                | Self::LockBusy(_)
        )
    }

    /// Returns whether the scheduler loop must stop
    #[must_use]
    pub const fn is_fatal_to_loop(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            Error::AccessUnavailable("git@host".into()).error_type(),
            "ACCESS_UNAVAILABLE"
        );
        assert_eq!(
            Error::malformed("cache", "bad json").error_type(),
            "MALFORMED_STATE"
        );
        assert_eq!(
            Error::InvalidIdentifier("x".into()).error_type(),
            "INVALID_ARGUMENT"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::LockBusy("gitstatus".into()).is_recoverable());
        assert!(
            Error::StatusCommand {
                command: "git status".into(),
                code: 128,
                output: String::new(),
            }
            .is_recoverable()
        );
        assert!(!Error::StorageUnavailable("/media".into()).is_recoverable());
        assert!(Error::StorageUnavailable("/media".into()).is_fatal_to_loop());
    }

    #[test]
    fn test_partial_write_keeps_changed_files() {
        let err = Error::PartialWrite {
            child_ids: vec!["ddr-test-123-1".into()],
            changed_files: vec![PathBuf::from("ddr-test-123/files/ddr-test-123-1/entity.json")],
            source: Box::new(Error::Io(std::io::Error::other("disk full"))),
        };
        assert_eq!(err.error_type(), "PARTIAL_WRITE");
        assert!(!err.is_recoverable());
        let msg = err.to_string();
        assert!(msg.contains("1 file(s)"), "{msg}");
        assert!(msg.contains("disk full"), "{msg}");
    }
}
