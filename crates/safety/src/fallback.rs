//! Safety fallback state machine
//!
//! Driven by two signals: network availability and emergency-delivery
//! outcomes.
//!
//! | from \ event          | net available | net unavailable (≥T) | em. failures ≥ N | em. success |
//! |-----------------------|---------------|----------------------|------------------|-------------|
//! | normal                | —             | limited_connectivity | emergency        | —           |
//! | limited_connectivity  | normal        | offline_safety       | emergency        | normal      |
//! | emergency             | —             | —                    | —                | normal      |
//! | offline_safety        | normal        | —                    | emergency        | —           |
//!
//! Entering `emergency` or `offline_safety` records an escalation
//! (history bounded at 100) and fires the local-alert callback. The
//! whole state is persisted so the mode survives restarts. A manual
//! `acknowledge` resets to normal.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use vital_core::{
    Counter, EscalationKind, EscalationRecord, EscalationSink, Operation, SafetyConfig,
    SafetyMode, TelemetrySink,
};
use vital_storage::{meta_keys, MetaStore};

/// Persisted safety state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SafetyState {
    mode: SafetyMode,
    network_unavailable_since: Option<DateTime<Utc>>,
    emergency_failure_count: u32,
    history: Vec<EscalationRecord>,
}

/// The safety fallback machine.
pub struct SafetyFallback {
    meta: MetaStore,
    config: SafetyConfig,
    state: Mutex<SafetyState>,
    alert: Arc<dyn EscalationSink>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SafetyFallback {
    /// Load (or initialize) the machine from the meta store.
    pub fn new(
        meta: MetaStore,
        config: SafetyConfig,
        alert: Arc<dyn EscalationSink>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let state: SafetyState = meta.get_or_default(meta_keys::SAFETY_FALLBACK);
        if state.mode != SafetyMode::Normal {
            tracing::warn!(mode = %state.mode, "restarting in a degraded safety mode");
        }
        SafetyFallback {
            meta,
            config,
            state: Mutex::new(state),
            alert,
            telemetry,
        }
    }

    /// Current operating mode.
    pub fn mode(&self) -> SafetyMode {
        self.state.lock().mode
    }

    /// Escalation history, oldest first.
    pub fn history(&self) -> Vec<EscalationRecord> {
        self.state.lock().history.clone()
    }

    /// Consecutive emergency failures since the last success.
    pub fn emergency_failure_count(&self) -> u32 {
        self.state.lock().emergency_failure_count
    }

    /// The network is reachable again.
    pub fn note_network_available(&self) {
        let mut state = self.state.lock();
        state.network_unavailable_since = None;
        match state.mode {
            SafetyMode::LimitedConnectivity | SafetyMode::OfflineSafety => {
                tracing::info!(from = %state.mode, "network restored; back to normal");
                state.mode = SafetyMode::Normal;
            }
            _ => {}
        }
        self.persist(&state);
    }

    /// The network is unreachable at `now`.
    ///
    /// Degrades to limited connectivity once the outage reaches the
    /// threshold, and from limited connectivity to offline safety once
    /// it reaches twice the threshold.
    pub fn note_network_unavailable(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let since = *state.network_unavailable_since.get_or_insert(now);
        let Ok(threshold) = chrono::Duration::from_std(self.config.network_unavailable_threshold)
        else {
            return;
        };
        let outage = now - since;
        match state.mode {
            SafetyMode::Normal if outage >= threshold => {
                tracing::warn!(outage_secs = outage.num_seconds(), "entering limited connectivity");
                state.mode = SafetyMode::LimitedConnectivity;
            }
            SafetyMode::LimitedConnectivity if outage >= threshold * 2 => {
                state.mode = SafetyMode::OfflineSafety;
                self.escalate(
                    &mut state,
                    EscalationKind::ModeOfflineSafety,
                    None,
                    format!("network unavailable for {}s", outage.num_seconds()),
                );
            }
            _ => {}
        }
        self.persist(&state);
    }

    /// An emergency delivery failed.
    pub fn note_emergency_failure(&self, op: Option<&Operation>) {
        let mut state = self.state.lock();
        state.emergency_failure_count += 1;
        if state.emergency_failure_count >= self.config.emergency_escalation_threshold
            && state.mode != SafetyMode::Emergency
        {
            state.mode = SafetyMode::Emergency;
            let failure_count = state.emergency_failure_count;
            self.escalate(
                &mut state,
                EscalationKind::ModeEmergency,
                op.map(|o| o.id.clone()),
                format!("{} consecutive emergency failures", failure_count),
            );
        }
        self.persist(&state);
    }

    /// An emergency delivery succeeded.
    pub fn note_emergency_success(&self) {
        let mut state = self.state.lock();
        state.emergency_failure_count = 0;
        match state.mode {
            SafetyMode::Emergency | SafetyMode::LimitedConnectivity => {
                tracing::info!(from = %state.mode, "emergency delivery succeeded; back to normal");
                state.mode = SafetyMode::Normal;
            }
            _ => {}
        }
        self.persist(&state);
    }

    /// An emergency op exhausted its attempts in the fast lane.
    pub fn note_escalated_op(&self, op: Option<&Operation>, reason: &str) {
        let mut state = self.state.lock();
        self.escalate(
            &mut state,
            EscalationKind::EmergencyOpExhausted,
            op.map(|o| o.id.clone()),
            reason.to_string(),
        );
        self.persist(&state);
    }

    /// Operator acknowledgement: reset to normal.
    pub fn acknowledge(&self) {
        let mut state = self.state.lock();
        state.mode = SafetyMode::Normal;
        state.emergency_failure_count = 0;
        state.network_unavailable_since = None;
        self.persist(&state);
        tracing::info!("safety fallback acknowledged; mode reset to normal");
    }

    fn escalate(
        &self,
        state: &mut SafetyState,
        kind: EscalationKind,
        op_id: Option<String>,
        reason: String,
    ) {
        let record = EscalationRecord::new(kind, op_id, reason);
        tracing::error!(
            kind = ?record.kind,
            reason = %record.reason,
            mode = %state.mode,
            "safety escalation"
        );
        state.history.push(record.clone());
        let limit = self.config.escalation_history_limit;
        if state.history.len() > limit {
            let excess = state.history.len() - limit;
            state.history.drain(..excess);
        }

        let mode = state.mode;
        let alert = self.alert.clone();
        let message = record.reason.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            alert.on_local_alert(mode, &message, &record);
        }));
        if result.is_err() {
            tracing::error!("local alert sink panicked");
            self.telemetry.incr(Counter::EscalationSinkError);
        }
    }

    fn persist(&self, state: &SafetyState) {
        self.meta.put(meta_keys::SAFETY_FALLBACK, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use vital_core::NoopTelemetry;
    use vital_storage::{BoxDescriptor, BoxRegistry, EncryptionPolicy, StorageEngine};

    #[derive(Default)]
    struct RecordingAlerts {
        alerts: PlMutex<Vec<(SafetyMode, String)>>,
    }

    impl EscalationSink for RecordingAlerts {
        fn on_escalation(&self, _op: Option<&Operation>, _reason: &str) {}
        fn on_local_alert(&self, mode: SafetyMode, message: &str, _record: &EscalationRecord) {
            self.alerts.lock().push((mode, message.to_string()));
        }
    }

    fn meta_at(dir: &std::path::Path) -> MetaStore {
        let registry = Arc::new(BoxRegistry::new());
        registry
            .register(BoxDescriptor::new("meta", EncryptionPolicy::Forbidden, 1, 1))
            .unwrap();
        let engine =
            Arc::new(StorageEngine::new(dir, registry, None, Arc::new(NoopTelemetry)).unwrap());
        MetaStore::new(engine.open_box("meta").unwrap())
    }

    fn machine(meta: MetaStore, alerts: Arc<RecordingAlerts>) -> SafetyFallback {
        SafetyFallback::new(
            meta,
            SafetyConfig::default(),
            alerts,
            Arc::new(NoopTelemetry),
        )
    }

    #[test]
    fn test_short_outage_stays_normal() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(meta_at(dir.path()), Arc::new(RecordingAlerts::default()));
        let start = Utc::now();
        m.note_network_unavailable(start);
        m.note_network_unavailable(start + chrono::Duration::seconds(60));
        assert_eq!(m.mode(), SafetyMode::Normal);
    }

    #[test]
    fn test_outage_past_threshold_degrades_then_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let alerts = Arc::new(RecordingAlerts::default());
        let m = machine(meta_at(dir.path()), alerts.clone());
        let start = Utc::now();

        m.note_network_unavailable(start);
        m.note_network_unavailable(start + chrono::Duration::minutes(5));
        assert_eq!(m.mode(), SafetyMode::LimitedConnectivity);

        m.note_network_unavailable(start + chrono::Duration::minutes(10));
        assert_eq!(m.mode(), SafetyMode::OfflineSafety);
        assert_eq!(alerts.alerts.lock().len(), 1, "offline safety raises an alert");
        assert_eq!(m.history().len(), 1);
    }

    #[test]
    fn test_network_restore_returns_to_normal() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(meta_at(dir.path()), Arc::new(RecordingAlerts::default()));
        let start = Utc::now();
        m.note_network_unavailable(start);
        m.note_network_unavailable(start + chrono::Duration::minutes(5));
        assert_eq!(m.mode(), SafetyMode::LimitedConnectivity);

        m.note_network_available();
        assert_eq!(m.mode(), SafetyMode::Normal);
    }

    #[test]
    fn test_emergency_failures_reach_emergency_mode() {
        let dir = tempfile::tempdir().unwrap();
        let alerts = Arc::new(RecordingAlerts::default());
        let m = machine(meta_at(dir.path()), alerts.clone());

        m.note_emergency_failure(None);
        m.note_emergency_failure(None);
        assert_eq!(m.mode(), SafetyMode::Normal);
        m.note_emergency_failure(None);
        assert_eq!(m.mode(), SafetyMode::Emergency);
        assert_eq!(alerts.alerts.lock().len(), 1);

        m.note_emergency_success();
        assert_eq!(m.mode(), SafetyMode::Normal);
        assert_eq!(m.emergency_failure_count(), 0);
    }

    #[test]
    fn test_mode_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let m = machine(meta_at(dir.path()), Arc::new(RecordingAlerts::default()));
            for _ in 0..3 {
                m.note_emergency_failure(None);
            }
            assert_eq!(m.mode(), SafetyMode::Emergency);
        }
        let m = machine(meta_at(dir.path()), Arc::new(RecordingAlerts::default()));
        assert_eq!(m.mode(), SafetyMode::Emergency, "mode persisted across restart");
        m.acknowledge();
        assert_eq!(m.mode(), SafetyMode::Normal);
    }

    #[test]
    fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(meta_at(dir.path()), Arc::new(RecordingAlerts::default()));
        for i in 0..120 {
            m.note_escalated_op(None, &format!("exhausted {}", i));
        }
        let history = m.history();
        assert_eq!(history.len(), 100, "history bounded at 100");
        assert!(history[0].reason.ends_with("20"), "oldest records dropped");
    }
}
