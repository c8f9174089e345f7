//! vitalstore: local-first persistence and synchronization core
//!
//! The durable substrate of a health-monitoring application: keyed
//! encrypted storage, a crash-safe transaction journal, a priority
//! operation queue with an emergency fast lane, idempotent enqueue,
//! per-entity ordering, stall self-healing, key rotation, and schema
//! migrations.
//!
//! # Example
//!
//! ```ignore
//! use vitalstore::prelude::*;
//!
//! let store = VitalStore::builder()
//!     .data_dir("./data")
//!     .consumer(my_sync_consumer)
//!     .open()?;
//!
//! store.enqueue(Operation::new("op-0001", "create", payload, Priority::Normal)).await?;
//! store.process_pending().await?;
//! store.shutdown();
//! ```
//!
//! The heavy lifting lives in the member crates (`vital-storage`,
//! `vital-journal`, `vital-queue`, `vital-safety`, `vital-migrate`);
//! this crate wires them together behind [`VitalStore`] and adds the
//! read-only [`health`] surface and the confirmed [`repair`] actions.

#![warn(clippy::all)]

pub mod error;
pub mod health;
pub mod prelude;
pub mod repair;
pub mod store;

pub use error::{Error, Result};
pub use health::{HealthAggregator, HealthSeverity, HealthSnapshot};
pub use repair::{RepairAction, RepairError, RepairOutcome, RepairToken, RepairToolkit};
pub use store::{VitalStore, VitalStoreBuilder};

// Re-export the vocabulary callers need without digging into member crates.
pub use vital_core::{
    CloudMirror, CoreConfig, Counter, DeliveryState, EntityKey, EscalationRecord, EscalationSink,
    FailedOp, FailureClass, NoopTelemetry, OpStatus, Operation, Priority, QueueConfig,
    SafetyConfig, SafetyMode, StallConfig, SyncConsumer, SyncOutcome, TelemetrySink,
    TracingTelemetry,
};
pub use vital_keys::{FileSecretStore, MemorySecretStore, SecretStore};
pub use vital_migrate::{DryRunReport, Migration, MigrationContext};
pub use vital_queue::{EmergencyEvent, QueueState};
pub use vital_safety::StallEvent;
pub use vital_storage::{BoxDescriptor, EncryptionPolicy, PolicyViolation};
