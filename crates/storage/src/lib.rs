//! Storage layer for vitalstore
//!
//! This crate provides the durable substrate everything else writes
//! through:
//! - Named boxes: append-only log files replayed into an in-memory map
//! - A CRC-framed on-disk format with magic and version headers
//! - Corruption recovery (backup + fresh box, never a failed open)
//! - Record-level AES-256-GCM encryption behind a per-box policy
//! - The always-unencrypted meta store
//! - The key-rotation executor that re-encrypts boxes under a candidate key
//!
//! Atomicity across boxes is not provided here; that is the transaction
//! journal's job (`vital-journal`).

#![warn(clippy::all)]

pub mod cipher;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod format;
pub mod meta;
pub mod rotation;

pub use cipher::BoxCipher;
pub use descriptor::{
    enforce_policies, BoxDescriptor, BoxRegistry, EncryptionPolicy, PolicyViolation,
};
pub use engine::{
    BoxHandle, StorageEngine, TypedBox, CORRUPTION_BACKUP_DIR, MIGRATION_BACKUP_DIR,
};
pub use error::{Result, StorageError};
pub use meta::{
    meta_keys, MetaStore, ProcessingLockRecord, RotationState, RotationStatus,
};
pub use rotation::{resume_if_in_progress, resume_or_rotate};
