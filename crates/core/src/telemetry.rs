//! Telemetry counters
//!
//! A single enum of counters with a thin emitter trait, instead of
//! per-component metric strings. The host wires a real backend; the
//! default implementations log or drop the signal.

/// Counters incremented across the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// A stale processing lock was reclaimed
    StaleLockRecovered,
    /// An operation exceeded its attempts and was isolated
    PoisonOpIsolated,
    /// An enqueue was rejected as a duplicate
    IdempotencyRejected,
    /// An op was skipped because its entity was in flight
    EntityBlocked,
    /// A consumer delivery failed transiently
    TransientFailure,
    /// A consumer delivery failed permanently
    PermanentFailure,
    /// A cloud mirror write failed (swallowed)
    MirrorFailure,
    /// An escalation or alert callback panicked or errored (swallowed)
    EscalationSinkError,
    /// An encryption policy violation was observed in soft mode
    PolicyViolation,
    /// A corrupt box was backed up and replaced with a fresh one
    CorruptionRecovered,
    /// The stall detector completed a recovery pass
    StallRecovery,
    /// An emergency operation escalated
    EmergencyEscalation,
    /// An uncommitted journal intent was replayed at startup
    JournalReplay,
    /// The encryption key failed to decode and was regenerated
    KeyRegenerated,
}

impl Counter {
    /// Stable metric name.
    pub fn name(self) -> &'static str {
        match self {
            Counter::StaleLockRecovered => "stale_lock_recovered",
            Counter::PoisonOpIsolated => "poison_op_isolated",
            Counter::IdempotencyRejected => "idempotency_rejected",
            Counter::EntityBlocked => "entity_blocked",
            Counter::TransientFailure => "transient_failure",
            Counter::PermanentFailure => "permanent_failure",
            Counter::MirrorFailure => "mirror_failure",
            Counter::EscalationSinkError => "escalation_sink_error",
            Counter::PolicyViolation => "policy_violation",
            Counter::CorruptionRecovered => "corruption_recovered",
            Counter::StallRecovery => "stall_recovery",
            Counter::EmergencyEscalation => "emergency_escalation",
            Counter::JournalReplay => "journal_replay",
            Counter::KeyRegenerated => "key_regenerated",
        }
    }
}

/// Thin emitter interface for counters.
pub trait TelemetrySink: Send + Sync {
    /// Increment a counter by one.
    fn incr(&self, counter: Counter);
}

/// Telemetry sink that drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn incr(&self, _counter: Counter) {}
}

/// Telemetry sink that forwards counters to structured logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn incr(&self, counter: Counter) {
        tracing::debug!(counter = counter.name(), "telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_names_are_unique() {
        use std::collections::HashSet;
        let counters = [
            Counter::StaleLockRecovered,
            Counter::PoisonOpIsolated,
            Counter::IdempotencyRejected,
            Counter::EntityBlocked,
            Counter::TransientFailure,
            Counter::PermanentFailure,
            Counter::MirrorFailure,
            Counter::EscalationSinkError,
            Counter::PolicyViolation,
            Counter::CorruptionRecovered,
            Counter::StallRecovery,
            Counter::EmergencyEscalation,
            Counter::JournalReplay,
            Counter::KeyRegenerated,
        ];
        let names: HashSet<_> = counters.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), counters.len(), "metric names must not collide");
    }
}
