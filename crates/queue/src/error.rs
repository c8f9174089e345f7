//! Queue error types

use thiserror::Error;
use vital_core::OpValidationError;
use vital_journal::JournalError;
use vital_storage::StorageError;

/// Errors raised by the queueing layer.
///
/// Ordinary outcomes (duplicate enqueue, entity blocked, lock refused)
/// are boolean or count returns, not errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The operation failed enqueue-time validation
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] OpValidationError),

    /// A non-emergency operation was offered to the emergency lane
    #[error("operation '{0}' is not emergency priority")]
    NotEmergency(String),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transaction failure
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
