//! Convenience re-exports for typical callers.

pub use crate::error::{Error, Result};
pub use crate::health::{HealthSeverity, HealthSnapshot};
pub use crate::repair::{RepairAction, RepairToolkit};
pub use crate::store::{VitalStore, VitalStoreBuilder};
pub use vital_core::{
    DeliveryState, EntityKey, FailureClass, OpStatus, Operation, Priority, SafetyMode,
    SyncConsumer, SyncOutcome,
};
pub use vital_queue::QueueState;
