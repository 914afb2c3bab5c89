//! Error types for the resilient download orchestrator.
//!
//! Errors are grouped by the component that raises them (`JournalError`,
//! `PartFileError`, `TransportError`) and rolled up into the top-level
//! [`Error`]. The [`Classify`] trait maps any error onto the four-way
//! [`FailureKind`] taxonomy the rest of the crate reasons about — retry,
//! dead-letter, and propagation decisions always switch on `kind()`, never
//! on a string or variant name.

use crate::types::{FailureKind, IntentId};
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the Journal (C1).
#[derive(Debug, Error)]
pub enum JournalError {
    /// The underlying store rejected a write.
    #[error("journal storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("journal migration failed: {0}")]
    MigrationFailed(String),

    /// `bump_failure` crossed `max_failures`; the row was moved to the
    /// dead-letter sink.
    #[error("intent {id} dead-lettered after {failure_count} failures")]
    DeadLettered {
        /// The intent that was dead-lettered.
        id: IntentId,
        /// The failure count that crossed the threshold.
        failure_count: u32,
    },
}

/// Errors raised by PartFile (C2) handshake and commit operations.
#[derive(Debug, Error)]
pub enum PartFileError {
    /// Any I/O failure while acquiring, appending, or truncating.
    #[error("part file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The atomic rename from `.part` to `target_path` failed — e.g.
    /// the two paths live on different filesystems. This is always
    /// permanent: retrying would hit the same precondition.
    #[error("commit rename failed for {target}: {source}")]
    RenameFailed {
        /// Destination path that could not be renamed into.
        target: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Ghost-file post-verification found a digest mismatch.
    #[error("ghost file digest mismatch for {target}")]
    DigestMismatch {
        /// Path whose on-disk content did not match `expected_digest`.
        target: std::path::PathBuf,
    },
}

/// Errors raised by the `PeerTransport` capability (external environment).
#[derive(Debug, Error)]
pub enum TransportError {
    /// No peer could be found for a source key.
    #[error("no peer available for source")]
    NotFound,

    /// A peer disconnected or reset mid-stream.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A read stalled past the configured idle timeout.
    #[error("peer read timed out")]
    Timeout,

    /// The peer sent bytes that did not start at the agreed resume offset.
    #[error("peer sent discontinuous bytes")]
    Discontinuity,

    /// A precondition the environment cannot satisfy (e.g. source key
    /// rejected outright). Never retried.
    #[error("permanent transport error: {0}")]
    Permanent(String),
}

/// Top-level error type for the orchestrator crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Journal (C1) failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// PartFile (C2) failure.
    #[error(transparent)]
    PartFile(#[from] PartFileError),

    /// PeerTransport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The intent is currently in the dead-letter sink and was not acted on.
    #[error("intent {id} is dead-lettered (failure_count={failure_count})")]
    DeadLettered {
        /// The affected intent.
        id: IntentId,
        /// Current failure count.
        failure_count: u32,
    },

    /// The orchestrator is shutting down and rejects new work.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Generic I/O error not attributable to a specific component.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw sqlx error surfaced from a call site that doesn't wrap its own.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Maps any error in the crate onto the four-way failure taxonomy from
/// the design: Transient, RecoverableAtBoot, Permanent, Poisoned.
///
/// This is a type-level distinction, not a string comparison — callers in
/// `RetryPolicy` and the Engine match on `kind()` to decide whether to
/// re-enter `Searching`, call `Journal.bump_failure`, or fail outright.
pub trait Classify {
    /// Classify this error.
    fn kind(&self) -> FailureKind;
}

impl Classify for TransportError {
    fn kind(&self) -> FailureKind {
        match self {
            TransportError::NotFound
            | TransportError::Disconnected(_)
            | TransportError::Timeout
            | TransportError::Discontinuity => FailureKind::Transient,
            TransportError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

impl Classify for PartFileError {
    fn kind(&self) -> FailureKind {
        match self {
            PartFileError::Io(_) => FailureKind::Transient,
            PartFileError::RenameFailed { .. } => FailureKind::Permanent,
            PartFileError::DigestMismatch { .. } => FailureKind::Transient,
        }
    }
}

impl Classify for JournalError {
    fn kind(&self) -> FailureKind {
        match self {
            JournalError::Storage(_) => FailureKind::Permanent,
            JournalError::MigrationFailed(_) => FailureKind::Permanent,
            JournalError::DeadLettered { .. } => FailureKind::Poisoned,
        }
    }
}

impl Classify for Error {
    fn kind(&self) -> FailureKind {
        match self {
            Error::Journal(e) => e.kind(),
            Error::PartFile(e) => e.kind(),
            Error::Transport(e) => e.kind(),
            Error::DeadLettered { .. } => FailureKind::Poisoned,
            Error::ShuttingDown => FailureKind::Permanent,
            Error::Io(_) => FailureKind::Transient,
            Error::Sqlx(_) => FailureKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_transport_variants() -> Vec<TransportError> {
        vec![
            TransportError::NotFound,
            TransportError::Disconnected("reset".into()),
            TransportError::Timeout,
            TransportError::Discontinuity,
            TransportError::Permanent("rejected".into()),
        ]
    }

    #[test]
    fn transient_transport_errors_never_classify_as_permanent_or_poisoned() {
        for e in all_transport_variants() {
            if !matches!(e, TransportError::Permanent(_)) {
                assert_eq!(e.kind(), FailureKind::Transient, "{e:?}");
            }
        }
    }

    #[test]
    fn permanent_transport_error_classifies_as_permanent() {
        assert_eq!(
            TransportError::Permanent("x".into()).kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn rename_failure_is_permanent_but_other_partfile_errors_are_transient() {
        let rename_err = PartFileError::RenameFailed {
            target: "/tmp/x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "cross-device link"),
        };
        assert_eq!(rename_err.kind(), FailureKind::Permanent);

        let digest_err = PartFileError::DigestMismatch {
            target: "/tmp/x".into(),
        };
        assert_eq!(digest_err.kind(), FailureKind::Transient);
    }

    #[test]
    fn dead_lettered_journal_error_classifies_as_poisoned() {
        let e = JournalError::DeadLettered {
            id: IntentId::new(),
            failure_count: 4,
        };
        assert_eq!(e.kind(), FailureKind::Poisoned);
    }

    #[test]
    fn top_level_error_delegates_classification_to_wrapped_variant() {
        let id = IntentId::new();
        let e = Error::DeadLettered {
            id,
            failure_count: 4,
        };
        assert_eq!(e.kind(), FailureKind::Poisoned);

        let e = Error::ShuttingDown;
        assert_eq!(e.kind(), FailureKind::Permanent);
    }
}
