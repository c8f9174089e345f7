//! Queueing layer for vitalstore
//!
//! Everything between "a caller hands us an operation" and "the consumer
//! acknowledged it" lives here:
//! - [`IdempotencyCache`]: TTL-bounded duplicate rejection
//! - [`PendingIndex`]: oldest-first index over the pending-op store
//! - [`EntityOrdering`]: one in-flight operation per entity
//! - [`ProcessingLock`]: one dispatcher run at a time
//! - [`PendingQueue`]: the priority dispatcher with backoff and poison
//!   isolation
//! - [`EmergencyQueue`]: the fast lane for life-critical operations
//! - [`FailedOpStore`]: bounded archive of poisoned and permanently
//!   failed operations
//!
//! All multi-box mutations go through the transaction journal so the
//! pending store and the index can never disagree after a crash.

#![warn(clippy::all)]

pub mod backoff;
pub mod boxes;
pub mod dispatch;
pub mod emergency;
pub mod entity;
pub mod error;
pub mod failed;
pub mod idempotency;
pub mod index;
pub mod lock;

pub use backoff::backoff_delay;
pub use boxes::{
    queue_descriptors, EMERGENCY_OPS_BOX, ENTITY_LOCKS_BOX, FAILED_OPS_BOX, IDEMPOTENCY_BOX,
    PENDING_INDEX_BOX, PENDING_OPS_BOX,
};
pub use dispatch::{PendingQueue, QueueState};
pub use emergency::{EmergencyEvent, EmergencyQueue, EmergencySignal, NoopEmergencySignal};
pub use entity::EntityOrdering;
pub use error::{QueueError, Result};
pub use failed::FailedOpStore;
pub use idempotency::IdempotencyCache;
pub use index::PendingIndex;
pub use lock::ProcessingLock;

/// Canonical error code for operations that exceeded their attempts.
pub const POISON_ERROR_CODE: &str = "POISON_OP";
