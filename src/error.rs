//! Unified error type for vitalstore
//!
//! Wraps the member-crate errors behind one stable surface. Ordinary
//! outcomes (duplicate enqueue, entity blocked, lock refused) never
//! appear here; they are value returns on the respective APIs.

use thiserror::Error;

/// All vitalstore errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The OS secret store denied access; the core cannot start
    #[error(transparent)]
    KeyStore(#[from] vital_keys::KeyStoreError),

    /// Storage failure (including strict-mode encryption violations)
    #[error(transparent)]
    Storage(#[from] vital_storage::StorageError),

    /// Transaction failure
    #[error(transparent)]
    Journal(#[from] vital_journal::JournalError),

    /// Queueing failure
    #[error(transparent)]
    Queue(#[from] vital_queue::QueueError),

    /// Migration failure (including the schema downgrade block)
    #[error(transparent)]
    Migration(#[from] vital_migrate::MigrationError),

    /// Repair action failure
    #[error(transparent)]
    Repair(#[from] crate::repair::RepairError),

    /// Operation validation failure
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] vital_core::OpValidationError),
}

/// Result alias for vitalstore operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the core cannot honor its invariants
    /// and startup must abort.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::KeyStore(vital_keys::KeyStoreError::Unavailable(_)) => true,
            Error::Storage(vital_storage::StorageError::PolicyViolation(_)) => true,
            Error::Storage(vital_storage::StorageError::TypeIdCollision { .. }) => true,
            Error::Migration(vital_migrate::MigrationError::PolicyViolation { .. }) => true,
            _ => false,
        }
    }
}
