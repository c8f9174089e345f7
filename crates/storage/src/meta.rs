//! The meta store
//!
//! An always-unencrypted box holding the handful of records recovery
//! decisions depend on: schema version, rotation progress, the
//! processing lock, queue state, safety mode. It must open before
//! anything else; its plaintext readability is how those decisions
//! survive loss of the encryption key.
//!
//! Writes are individually best-effort: a failed meta write is logged
//! and swallowed. Readers tolerate missing or unparseable values by
//! returning defaults.

use crate::engine::BoxHandle;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical meta keys.
pub mod meta_keys {
    /// Stored schema version (u32)
    pub const SCHEMA_VERSION: &str = "schema_version";
    /// Key-rotation progress record
    pub const ROTATION_STATE: &str = "rotation_state";
    /// Singleton dispatcher lock record
    pub const PROCESSING_LOCK: &str = "processing_lock";
    /// Last observed queue state string
    pub const QUEUE_STATE: &str = "queue_state";
    /// Persisted safety-fallback state
    pub const SAFETY_FALLBACK: &str = "safety_fallback";
    /// Prefix for per-migration ack records
    pub const MIGRATION_ACK_PREFIX: &str = "migration_ack:";
}

/// Rotation progress status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    /// No rotation running
    Idle,
    /// Rotation started; `boxes_completed` tracks progress
    InProgress,
}

/// Persisted rotation progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    /// Current status
    pub status: RotationStatus,
    /// When the rotation began
    pub started_at: Option<DateTime<Utc>>,
    /// Boxes already re-encrypted under the candidate key
    pub boxes_completed: Vec<String>,
}

impl Default for RotationState {
    fn default() -> Self {
        RotationState {
            status: RotationStatus::Idle,
            started_at: None,
            boxes_completed: Vec::new(),
        }
    }
}

/// Persisted processing-lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLockRecord {
    /// Identifier of the holder (process/session id)
    pub holder: String,
    /// When the lock was taken
    pub started_at: DateTime<Utc>,
    /// Set when the lock was reclaimed from a stale holder
    #[serde(default)]
    pub stale_recovered: bool,
}

/// Typed accessor over the meta box.
#[derive(Clone)]
pub struct MetaStore {
    handle: Arc<BoxHandle>,
}

impl MetaStore {
    /// Wrap the (already opened, unencrypted) meta box.
    pub fn new(handle: Arc<BoxHandle>) -> Self {
        MetaStore { handle }
    }

    /// Read a value; missing or unparseable entries yield `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.handle.get_raw(key)?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "unparseable meta entry ignored");
                None
            }
        }
    }

    /// Read a value, falling back to its default.
    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Best-effort write; returns whether it stuck.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "meta value failed to encode");
                return false;
            }
        };
        match self.handle.put_raw(key, bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "meta write failed");
                false
            }
        }
    }

    /// Best-effort delete; returns whether it stuck.
    pub fn delete(&self, key: &str) -> bool {
        match self.handle.delete_raw(key) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "meta delete failed");
                false
            }
        }
    }

    /// Stored schema version; 0 when none was ever written.
    pub fn schema_version(&self) -> u32 {
        self.get(meta_keys::SCHEMA_VERSION).unwrap_or(0)
    }

    /// Persist the schema version.
    pub fn set_schema_version(&self, version: u32) -> bool {
        self.put(meta_keys::SCHEMA_VERSION, &version)
    }

    /// Current rotation state (default: idle).
    pub fn rotation_state(&self) -> RotationState {
        self.get_or_default(meta_keys::ROTATION_STATE)
    }

    /// Persist rotation state.
    pub fn set_rotation_state(&self, state: &RotationState) -> bool {
        self.put(meta_keys::ROTATION_STATE, state)
    }

    /// Current processing-lock record, if held.
    pub fn processing_lock(&self) -> Option<ProcessingLockRecord> {
        self.get(meta_keys::PROCESSING_LOCK)
    }

    /// The underlying handle (health reporting).
    pub fn handle(&self) -> &Arc<BoxHandle> {
        &self.handle
    }
}
