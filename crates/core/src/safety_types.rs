//! Shared safety-mode types
//!
//! These live in the core crate because both the queue (emergency
//! escalations) and the safety state machine reference them, and the
//! escalation sink trait needs them in its signature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Externally visible operating mode of the safety fallback machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    /// Everything nominal
    Normal,
    /// Network has been unavailable past the threshold
    LimitedConnectivity,
    /// Emergency operations are failing
    Emergency,
    /// Prolonged offline operation; strongest local safeguards
    OfflineSafety,
}

impl Default for SafetyMode {
    fn default() -> Self {
        SafetyMode::Normal
    }
}

impl std::fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SafetyMode::Normal => "normal",
            SafetyMode::LimitedConnectivity => "limited_connectivity",
            SafetyMode::Emergency => "emergency",
            SafetyMode::OfflineSafety => "offline_safety",
        };
        write!(f, "{}", name)
    }
}

/// Why an escalation record was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// An emergency operation exhausted its attempts
    EmergencyOpExhausted,
    /// The safety machine entered emergency mode
    ModeEmergency,
    /// The safety machine entered offline-safety mode
    ModeOfflineSafety,
}

/// Record of a transition into a critical mode or an exhausted emergency
/// operation. History is bounded; oldest entries drop first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Unique record id
    pub id: Uuid,
    /// What kind of escalation this is
    pub kind: EscalationKind,
    /// The operation involved, if any
    pub op_id: Option<String>,
    /// Human-readable reason
    pub reason: String,
    /// When the escalation happened
    pub timestamp: DateTime<Utc>,
}

impl EscalationRecord {
    /// Build a new record stamped with the current time.
    pub fn new(kind: EscalationKind, op_id: Option<String>, reason: impl Into<String>) -> Self {
        EscalationRecord {
            id: Uuid::new_v4(),
            kind,
            op_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display_names() {
        assert_eq!(SafetyMode::Normal.to_string(), "normal");
        assert_eq!(
            SafetyMode::LimitedConnectivity.to_string(),
            "limited_connectivity"
        );
        assert_eq!(SafetyMode::OfflineSafety.to_string(), "offline_safety");
    }

    #[test]
    fn test_escalation_record_roundtrip() {
        let record = EscalationRecord::new(
            EscalationKind::EmergencyOpExhausted,
            Some("op-1".into()),
            "5 attempts failed",
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: EscalationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
