//! Encryption key custody for vitalstore
//!
//! This crate owns the per-app symmetric key and its rotation
//! bookkeeping:
//! - [`SecretStore`]: abstraction over the OS secret store
//! - [`KeyStore`]: loads, generates, and rotates the 256-bit key
//! - [`EncryptionKey`]: zeroized key material handed to the storage cipher
//!
//! Rotation is a three-secret protocol. `begin_rotation` copies the
//! current key to `enc_key_prev` and writes a fresh candidate under
//! `enc_key_v1_candidate`; once every required-encryption box has been
//! re-encrypted the caller invokes `commit_rotation`, which promotes the
//! candidate to `enc_key_v1` and deletes the previous key. The rotation
//! progress record itself lives in the unencrypted meta store so a crash
//! mid-rotation can resume from the next not-yet-completed box.

#![warn(clippy::all)]

pub mod keystore;
pub mod secret_store;

pub use keystore::{
    EncryptionKey, KeyStore, KeyStoreError, KEY_LEN, SECRET_CANDIDATE, SECRET_CURRENT,
    SECRET_PREVIOUS,
};
pub use secret_store::{FileSecretStore, MemorySecretStore, SecretStore, SecretStoreError};
