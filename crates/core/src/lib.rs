//! Core types for the vitalstore persistence and synchronization engine
//!
//! This crate defines the fundamental types shared by every other crate in
//! the workspace:
//! - [`Operation`]: the unit of work carried by the pending and emergency queues
//! - [`Priority`] / [`DeliveryState`] / [`OpStatus`]: operation lifecycle enums
//! - [`EntityKey`]: per-entity ordering key
//! - Configuration structs with the canonical timing constants
//! - Telemetry counters and the sink traits injected by the host application
//!
//! Nothing here performs I/O. The storage, journal, queue and safety crates
//! build on these types; the root `vitalstore` crate composes them.

#![warn(clippy::all)]

pub mod config;
pub mod op;
pub mod safety_types;
pub mod sinks;
pub mod telemetry;

pub use config::{CoreConfig, QueueConfig, SafetyConfig, StallConfig};
pub use op::{
    DeliveryState, EntityKey, FailedOp, OpStatus, OpValidationError, Operation, Priority,
};
pub use safety_types::{EscalationKind, EscalationRecord, SafetyMode};
pub use sinks::{
    AuditPhase, AuditRecord, AuditSink, CloudMirror, EscalationSink, FailureClass,
    NoopEscalationSink, SyncConsumer, SyncOutcome, TracingAuditSink, MIRROR_BATCH_LIMIT,
};
pub use telemetry::{Counter, NoopTelemetry, TelemetrySink, TracingTelemetry};
