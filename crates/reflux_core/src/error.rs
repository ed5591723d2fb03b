//! Error types for reflux core.

use crate::types::{FieldName, HandleId, SnapshotId};
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// One conflicting object reported by a failed rebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The conflicting object.
    pub object: HandleId,
    /// Hint of the conflicting object.
    pub hint: String,
    /// Fields changed both by this transaction and by the intervening commit.
    pub fields: Vec<FieldName>,
    /// Transaction that committed the intervening change.
    pub snapshot: SnapshotId,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}{} {}.{}", self.snapshot, self.object, self.hint, field)?;
        }
        Ok(())
    }
}

fn list(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur in reflux core operations.
///
/// Errors are cloneable: the terminal error of a transaction is handed to
/// every continuation bound to it and to every `when_finished` waiter.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Illegal API use. Never retried.
    #[error("misuse: {message}")]
    Misuse {
        /// Description of the misuse.
        message: String,
    },

    /// A committed change intersects the read/write set of a transaction.
    #[error("transaction {transaction} ({hint}) conflicts with other transactions on: {}", list(.conflicts))]
    Conflict {
        /// The transaction that failed to commit.
        transaction: SnapshotId,
        /// Hint of the transaction.
        hint: String,
        /// The conflicting objects and fields.
        conflicts: Vec<Conflict>,
    },

    /// A cache entry configured to prevent reentrance was invoked while running.
    #[error("{cache} is not reentrant over {running}")]
    Reentrance {
        /// Hint of the cache entry.
        cache: String,
        /// Description of the run in progress.
        running: String,
    },

    /// The transaction was canceled explicitly.
    #[error("transaction {transaction} ({hint}) is canceled: {reason}")]
    Canceled {
        /// The canceled transaction.
        transaction: SnapshotId,
        /// Hint of the transaction.
        hint: String,
        /// Reason for cancellation.
        reason: String,
    },

    /// The field was never assigned on the object.
    #[error("field {field} of {object} is not defined")]
    UnknownField {
        /// Description of the object.
        object: String,
        /// The missing field.
        field: FieldName,
    },

    /// The field holds a value of another type.
    #[error("field {field} of {object} is not of type {expected}")]
    TypeMismatch {
        /// Description of the object.
        object: String,
        /// The field that was read.
        field: FieldName,
        /// Requested type name.
        expected: &'static str,
    },

    /// Failure raised by user code running inside a transaction or cache.
    #[error("{message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },

    /// An internal invariant was violated while applying a commit.
    #[error("internal invariant violated: {message}")]
    Fatal {
        /// Description of the violation.
        message: String,
    },
}

impl CoreError {
    /// Creates a misuse error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    /// Creates a user-level failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Creates a cancellation error for a transaction.
    pub fn canceled(transaction: SnapshotId, hint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Canceled {
            transaction,
            hint: hint.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is a cancellation error.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns true if re-running the same body may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Canceled { .. })
    }
}
