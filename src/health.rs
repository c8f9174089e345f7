//! Read-only health surface
//!
//! The aggregator composes the queue, the fast lane, the safety machine
//! and the stall detector into one serializable snapshot for admin
//! tooling and the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vital_core::SafetyMode;
use vital_queue::{EmergencyQueue, PendingQueue, QueueState};
use vital_safety::{SafetyFallback, StallDetector};
use vital_storage::{MetaStore, PolicyViolation, ProcessingLockRecord};

/// Overall severity of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSeverity {
    /// Everything nominal
    Healthy,
    /// Degraded but functional
    Warning,
    /// Requires attention now
    Critical,
}

/// Point-in-time view of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Overall severity
    pub severity: HealthSeverity,
    /// Dispatcher state
    pub queue_state: QueueState,
    /// Operations waiting in the pending store
    pub pending_count: usize,
    /// Entries in the failed-op store
    pub failed_count: usize,
    /// Operations in the emergency lane
    pub emergency_count: usize,
    /// Escalated emergency operations kept for audit
    pub escalated_count: usize,
    /// Safety fallback mode
    pub safety_mode: SafetyMode,
    /// Whether the stall detector currently sees a stall
    pub stalled: bool,
    /// Stall recovery attempts since the last unstall
    pub recovery_attempts: u32,
    /// Stored schema version
    pub schema_version: u32,
    /// Encryption policy violations observed at startup
    pub policy_violations: Vec<PolicyViolation>,
    /// Processing lock record, if held
    pub processing_lock: Option<ProcessingLockRecord>,
    /// Entity locks currently held
    pub entity_locks_held: usize,
    /// When this snapshot was taken
    pub generated_at: DateTime<Utc>,
}

/// Read-only snapshot surface over the core's services.
pub struct HealthAggregator {
    queue: Arc<PendingQueue>,
    emergency: Arc<EmergencyQueue>,
    safety: Arc<SafetyFallback>,
    stall: Arc<StallDetector>,
    meta: MetaStore,
    policy_violations: Vec<PolicyViolation>,
}

impl HealthAggregator {
    /// Compose the aggregator.
    pub fn new(
        queue: Arc<PendingQueue>,
        emergency: Arc<EmergencyQueue>,
        safety: Arc<SafetyFallback>,
        stall: Arc<StallDetector>,
        meta: MetaStore,
        policy_violations: Vec<PolicyViolation>,
    ) -> Self {
        HealthAggregator {
            queue,
            emergency,
            safety,
            stall,
            meta,
            policy_violations,
        }
    }

    /// Take a snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        let pending_count = self.queue.pending_count();
        let failed_count = self.queue.failed().len();
        let escalated_count = self.emergency.escalated_count();
        let safety_mode = self.safety.mode();
        let stalled = self.stall.is_stalled();

        let severity = Self::severity(
            &self.policy_violations,
            safety_mode,
            escalated_count,
            pending_count,
            failed_count,
            stalled,
        );

        HealthSnapshot {
            severity,
            queue_state: self.queue.state(),
            pending_count,
            failed_count,
            emergency_count: self.emergency.len(),
            escalated_count,
            safety_mode,
            stalled,
            recovery_attempts: self.stall.recovery_attempts(),
            schema_version: self.meta.schema_version(),
            policy_violations: self.policy_violations.clone(),
            processing_lock: self.queue.processing_lock().record(),
            entity_locks_held: self.queue.entity_locks_held(),
            generated_at: Utc::now(),
        }
    }

    fn severity(
        violations: &[PolicyViolation],
        safety_mode: SafetyMode,
        escalated_count: usize,
        pending_count: usize,
        failed_count: usize,
        stalled: bool,
    ) -> HealthSeverity {
        let encryption_critical = violations.iter().any(|v| v.is_security_critical());
        let emergency_critical = matches!(
            safety_mode,
            SafetyMode::Emergency | SafetyMode::OfflineSafety
        ) && escalated_count > 0;
        if encryption_critical || emergency_critical {
            return HealthSeverity::Critical;
        }

        let degraded = pending_count > 0
            || failed_count > 0
            || stalled
            || safety_mode != SafetyMode::Normal
            || !violations.is_empty();
        if degraded {
            HealthSeverity::Warning
        } else {
            HealthSeverity::Healthy
        }
    }
}
