//! Box descriptors owned by the queueing layer

use vital_storage::{BoxDescriptor, EncryptionPolicy};

/// Pending-operation store.
pub const PENDING_OPS_BOX: &str = "pending_ops";
/// Oldest-first index over the pending store.
pub const PENDING_INDEX_BOX: &str = "pending_index";
/// Bounded store of poisoned and permanently failed operations.
pub const FAILED_OPS_BOX: &str = "failed_ops";
/// Fast-lane store for emergency operations.
pub const EMERGENCY_OPS_BOX: &str = "emergency_ops";
/// Persisted per-entity lock records.
pub const ENTITY_LOCKS_BOX: &str = "entity_locks";
/// Idempotency-key first-seen timestamps.
pub const IDEMPOTENCY_BOX: &str = "idempotency";

/// Descriptors for every queue-owned box.
///
/// Operation payloads are patient data, so the op stores require
/// encryption; the bookkeeping boxes are content-free (ids, timestamps)
/// and take it opportunistically.
pub fn queue_descriptors() -> Vec<BoxDescriptor> {
    vec![
        BoxDescriptor::new(PENDING_OPS_BOX, EncryptionPolicy::Required, 10, 1),
        BoxDescriptor::new(PENDING_INDEX_BOX, EncryptionPolicy::Optional, 11, 1),
        BoxDescriptor::new(FAILED_OPS_BOX, EncryptionPolicy::Required, 12, 1),
        BoxDescriptor::new(EMERGENCY_OPS_BOX, EncryptionPolicy::Required, 13, 1),
        BoxDescriptor::new(ENTITY_LOCKS_BOX, EncryptionPolicy::Optional, 14, 1),
        BoxDescriptor::new(IDEMPOTENCY_BOX, EncryptionPolicy::Optional, 15, 1),
    ]
}
