//! External collaborator interfaces
//!
//! The core never talks to the network or the UI directly. Everything
//! that crosses that boundary is an injected trait object:
//! - [`SyncConsumer`]: delivers operations upstream and classifies failures
//! - [`CloudMirror`]: fire-and-forget cloud mirror; failures never propagate
//! - [`EscalationSink`]: escalation and local-alert callbacks, best-effort
//! - [`AuditSink`]: receives repair-action audit records

use crate::op::Operation;
use crate::safety_types::{EscalationRecord, SafetyMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum record count accepted by [`CloudMirror::mirror_batch`].
pub const MIRROR_BATCH_LIMIT: usize = 500;

/// Failure classification reported by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Authentication or authorization failure; pauses the queue
    Auth,
    /// Payload rejected upstream
    Validation,
    /// Target entity does not exist upstream
    NotFound,
    /// Upstream version conflict (local wins, op is dropped)
    Conflict,
    /// Upstream throttling
    RateLimited,
    /// Upstream server error
    Server,
    /// Local client error
    Client,
    /// Anything else
    Unknown,
}

impl FailureClass {
    /// Whether this classification defaults to a retryable failure.
    ///
    /// `RateLimited` and `Server` retry under backoff; `Validation`,
    /// `NotFound` and `Conflict` are permanent by default.
    pub fn default_is_transient(self) -> bool {
        matches!(
            self,
            FailureClass::RateLimited | FailureClass::Server | FailureClass::Unknown
        )
    }

    /// Canonical error-code string for the failed-op store.
    pub fn error_code(self) -> &'static str {
        match self {
            FailureClass::Auth => "AUTH",
            FailureClass::Validation => "VALIDATION",
            FailureClass::NotFound => "NOT_FOUND",
            FailureClass::Conflict => "CONFLICT",
            FailureClass::RateLimited => "RATE_LIMITED",
            FailureClass::Server => "SERVER",
            FailureClass::Client => "CLIENT",
            FailureClass::Unknown => "UNKNOWN",
        }
    }
}

/// Outcome of a single consumer delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Delivered and acknowledged upstream
    Success,
    /// Retryable failure; the op goes back under backoff
    TransientFailure(String),
    /// Non-retryable failure; the op moves to the failed store
    PermanentFailure(FailureClass, String),
    /// Delivered but acknowledgement is pending; the op is kept as sent
    AckPending,
}

/// Upstream delivery interface injected by the host application.
///
/// `on_queue_start` and `on_queue_end` are invoked exactly once per
/// processing run, even when the run errors or exits early.
#[async_trait]
pub trait SyncConsumer: Send + Sync {
    /// Called once at the start of each processing run.
    async fn on_queue_start(&self) {}

    /// Called once at the end of each processing run.
    async fn on_queue_end(&self) {}

    /// Deliver a single operation upstream.
    async fn process(&self, op: &Operation) -> SyncOutcome;
}

/// Fire-and-forget cloud mirror sink.
///
/// Writes are idempotent upstream (same id replaces). Implementations
/// own their scheduling and must swallow their own failures; the core
/// only records telemetry and never awaits delivery guarantees.
#[async_trait]
pub trait CloudMirror: Send + Sync {
    /// Mirror a single operation record.
    async fn mirror(&self, op: &Operation);

    /// Mirror up to [`MIRROR_BATCH_LIMIT`] records.
    async fn mirror_batch(&self, ops: &[Operation]);
}

/// Escalation and local-alert callbacks.
///
/// Both are best-effort: errors thrown by the host are caught by the
/// caller and counted, never propagated.
pub trait EscalationSink: Send + Sync {
    /// An operation escalated (exhausted its emergency attempts).
    fn on_escalation(&self, op: Option<&Operation>, reason: &str);

    /// The safety machine entered a critical mode.
    fn on_local_alert(&self, mode: SafetyMode, message: &str, record: &EscalationRecord);
}

/// No-op escalation sink for installs without an alert channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEscalationSink;

impl EscalationSink for NoopEscalationSink {
    fn on_escalation(&self, _op: Option<&Operation>, _reason: &str) {}
    fn on_local_alert(&self, _mode: SafetyMode, _message: &str, _record: &EscalationRecord) {}
}

/// Phase of a repair-action audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    /// Action is about to run
    Started,
    /// Action finished successfully
    Completed,
    /// Action failed
    Error,
}

/// Audit record emitted around every repair-action invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Repair action name
    pub action: String,
    /// Which phase this record marks
    pub phase: AuditPhase,
    /// When the record was emitted
    pub at: DateTime<Utc>,
    /// Before/after state and action-specific metadata
    pub details: serde_json::Value,
}

/// Receiver for repair audit records.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, record: &AuditRecord);
}

/// Audit sink that forwards records to structured logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        tracing::info!(
            action = %record.action,
            phase = ?record.phase,
            details = %record.details,
            "repair audit"
        );
    }
}
