//! Storage error types

use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A box file failed header or checksum validation
    #[error("box '{box_name}' is corrupt: {reason}")]
    Corrupt {
        /// The box whose file failed validation
        box_name: String,
        /// What failed
        reason: String,
    },

    /// Record failed to encode or decode
    #[error("codec error in box '{box_name}': {reason}")]
    Codec {
        /// The box the record belongs to
        box_name: String,
        /// What failed
        reason: String,
    },

    /// Encryption or decryption failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Two descriptors registered the same type id
    #[error("type id {type_id} registered by both '{existing}' and '{duplicate}'")]
    TypeIdCollision {
        /// Colliding type id
        type_id: u16,
        /// Box that registered it first
        existing: String,
        /// Box that tried to register it again
        duplicate: String,
    },

    /// A box name was used twice
    #[error("box '{0}' is already registered")]
    DuplicateBox(String),

    /// Operation referenced a box the engine does not know
    #[error("unknown box '{0}'")]
    UnknownBox(String),

    /// A required-encryption box opened without encryption (or a
    /// forbidden box with it) while strict mode is on
    #[error("encryption policy violation: {0}")]
    PolicyViolation(String),

    /// The key store could not be reached
    #[error(transparent)]
    KeyStore(#[from] vital_keys::KeyStoreError),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
