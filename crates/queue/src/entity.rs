//! Per-entity ordering locks
//!
//! At most one operation per entity key is in flight at any instant.
//! Locks are held in memory for fast checks and written through to the
//! entity-locks box so a crash mid-dispatch cannot block the next
//! session past the lock timeout. A lock whose age has reached the
//! timeout is reclaimable.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vital_core::Operation;
use vital_storage::TypedBox;

/// Persisted per-entity lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLockRecord {
    /// The locked entity key
    pub entity_key: String,
    /// The operation holding the lock
    pub op_id: String,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
    /// When the lock becomes reclaimable
    pub expires_at: DateTime<Utc>,
}

/// Per-entity mutex with persistence and stale-lock timeout.
pub struct EntityOrdering {
    locks: DashMap<String, EntityLockRecord>,
    store: TypedBox<EntityLockRecord>,
    timeout: Duration,
}

impl EntityOrdering {
    /// Wrap the entity-locks box, loading surviving lock records.
    ///
    /// Records already expired at load time are dropped immediately.
    pub fn new(store: TypedBox<EntityLockRecord>, timeout: Duration) -> Self {
        let locks = DashMap::new();
        let now = Utc::now();
        for key in store.keys() {
            match store.get(&key) {
                Ok(Some(record)) if record.expires_at > now => {
                    locks.insert(record.entity_key.clone(), record);
                }
                _ => {
                    let _ = store.delete(&key);
                }
            }
        }
        EntityOrdering {
            locks,
            store,
            timeout,
        }
    }

    /// Try to lock the operation's entity.
    ///
    /// Operations without an entity key always succeed and record
    /// nothing. A different op holding a non-expired lock is a refusal
    /// (`false`), not an error; the dispatcher skips and retries on the
    /// next pass.
    pub fn try_acquire(&self, op: &Operation, now: DateTime<Utc>) -> bool {
        let Some(entity_key) = op.effective_entity_key() else {
            return true;
        };
        let entity_key = entity_key.as_str().to_string();

        if let Some(existing) = self.locks.get(&entity_key) {
            if existing.op_id != op.id && existing.expires_at > now {
                return false;
            }
        }
        let expires_at = now
            + chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let record = EntityLockRecord {
            entity_key: entity_key.clone(),
            op_id: op.id.clone(),
            acquired_at: now,
            expires_at,
        };
        // Persistence is best-effort; the in-memory lock is authoritative
        // for this session and the timeout bounds the damage after a crash.
        if let Err(e) = self.store.put(&entity_key, &record) {
            tracing::warn!(entity = %entity_key, error = %e, "entity lock persist failed");
        }
        self.locks.insert(entity_key, record);
        true
    }

    /// Release the lock if `op` still holds it.
    pub fn release(&self, op: &Operation) {
        let Some(entity_key) = op.effective_entity_key() else {
            return;
        };
        let entity_key = entity_key.as_str().to_string();
        let held_by_op = self
            .locks
            .get(&entity_key)
            .map(|r| r.op_id == op.id)
            .unwrap_or(false);
        if held_by_op {
            self.locks.remove(&entity_key);
            if let Err(e) = self.store.delete(&entity_key) {
                tracing::warn!(entity = %entity_key, error = %e, "entity lock delete failed");
            }
        }
    }

    /// Delete locks whose expiry has passed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.locks.remove(key);
            let _ = self.store.delete(key);
        }
        expired.len()
    }

    /// Number of currently held locks.
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }
}
