//! Box descriptors, type-id registry and encryption policy enforcement

use crate::error::{Result, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use vital_core::{Counter, TelemetrySink};

/// Encryption requirement for a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// The box must open encrypted; opening it plaintext is a violation
    Required,
    /// Encrypted when a cipher is available, plaintext otherwise
    Optional,
    /// The box must stay plaintext (the meta store)
    Forbidden,
}

/// Static description of a box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxDescriptor {
    /// Unique box name; also the file stem
    pub name: String,
    /// Encryption requirement
    pub encryption_policy: EncryptionPolicy,
    /// Stable numeric identifier for the record schema
    pub type_id: u16,
    /// Current schema version for records in this box
    pub schema_version: u32,
}

impl BoxDescriptor {
    /// Convenience constructor.
    pub fn new(
        name: impl Into<String>,
        encryption_policy: EncryptionPolicy,
        type_id: u16,
        schema_version: u32,
    ) -> Self {
        BoxDescriptor {
            name: name.into(),
            encryption_policy,
            type_id,
            schema_version,
        }
    }
}

/// Registry of every box the engine may open.
///
/// Type ids are assigned once per record schema; a collision is a hard
/// startup error because it means two schemas would decode each other's
/// records.
#[derive(Default)]
pub struct BoxRegistry {
    descriptors: RwLock<BTreeMap<String, BoxDescriptor>>,
}

impl BoxRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, rejecting duplicate names and type ids.
    pub fn register(&self, descriptor: BoxDescriptor) -> Result<()> {
        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(&descriptor.name) {
            return Err(StorageError::DuplicateBox(descriptor.name));
        }
        if let Some(existing) = descriptors
            .values()
            .find(|d| d.type_id == descriptor.type_id)
        {
            return Err(StorageError::TypeIdCollision {
                type_id: descriptor.type_id,
                existing: existing.name.clone(),
                duplicate: descriptor.name,
            });
        }
        descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<BoxDescriptor> {
        self.descriptors.read().get(name).cloned()
    }

    /// All registered descriptors, name-ordered.
    pub fn all(&self) -> Vec<BoxDescriptor> {
        self.descriptors.read().values().cloned().collect()
    }

    /// Names of boxes whose policy is not `Forbidden`, name-ordered.
    ///
    /// These are the boxes the rotation executor re-encrypts.
    pub fn encryptable_names(&self) -> Vec<String> {
        self.descriptors
            .read()
            .values()
            .filter(|d| d.encryption_policy != EncryptionPolicy::Forbidden)
            .map(|d| d.name.clone())
            .collect()
    }
}

/// A policy mismatch observed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Offending box
    pub box_name: String,
    /// Declared policy
    pub policy: EncryptionPolicy,
    /// Whether the box actually opened with encryption
    pub opened_encrypted: bool,
}

impl PolicyViolation {
    /// Required-box violations are always security-critical.
    pub fn is_security_critical(&self) -> bool {
        self.policy == EncryptionPolicy::Required
    }
}

/// Validate every opened box against its declared policy.
///
/// `opened` maps box name to whether it opened encrypted. In strict mode
/// any violation aborts startup; in soft mode violations are returned
/// and counted, and the app continues degraded.
pub fn enforce_policies(
    registry: &BoxRegistry,
    opened: &BTreeMap<String, bool>,
    strict: bool,
    telemetry: &Arc<dyn TelemetrySink>,
) -> Result<Vec<PolicyViolation>> {
    let mut violations = Vec::new();
    for (name, encrypted) in opened {
        let Some(descriptor) = registry.get(name) else {
            continue;
        };
        let violated = match descriptor.encryption_policy {
            EncryptionPolicy::Required => !encrypted,
            EncryptionPolicy::Forbidden => *encrypted,
            EncryptionPolicy::Optional => false,
        };
        if violated {
            let violation = PolicyViolation {
                box_name: name.clone(),
                policy: descriptor.encryption_policy,
                opened_encrypted: *encrypted,
            };
            tracing::error!(
                box_name = %violation.box_name,
                policy = ?violation.policy,
                opened_encrypted = violation.opened_encrypted,
                security_critical = violation.is_security_critical(),
                "encryption policy violation"
            );
            telemetry.incr(Counter::PolicyViolation);
            violations.push(violation);
        }
    }
    if strict {
        if let Some(v) = violations.first() {
            return Err(StorageError::PolicyViolation(format!(
                "box '{}' declared {:?} but opened {}",
                v.box_name,
                v.policy,
                if v.opened_encrypted {
                    "encrypted"
                } else {
                    "plaintext"
                }
            )));
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_core::NoopTelemetry;

    fn telemetry() -> Arc<dyn TelemetrySink> {
        Arc::new(NoopTelemetry)
    }

    #[test]
    fn test_type_id_collision_is_hard_error() {
        let registry = BoxRegistry::new();
        registry
            .register(BoxDescriptor::new("a", EncryptionPolicy::Optional, 1, 1))
            .unwrap();
        let err = registry
            .register(BoxDescriptor::new("b", EncryptionPolicy::Optional, 1, 1))
            .unwrap_err();
        assert!(matches!(err, StorageError::TypeIdCollision { .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = BoxRegistry::new();
        registry
            .register(BoxDescriptor::new("a", EncryptionPolicy::Optional, 1, 1))
            .unwrap();
        assert!(matches!(
            registry.register(BoxDescriptor::new("a", EncryptionPolicy::Optional, 2, 1)),
            Err(StorageError::DuplicateBox(_))
        ));
    }

    #[test]
    fn test_required_box_opened_plaintext_is_violation() {
        let registry = BoxRegistry::new();
        registry
            .register(BoxDescriptor::new("ops", EncryptionPolicy::Required, 1, 1))
            .unwrap();
        let mut opened = BTreeMap::new();
        opened.insert("ops".to_string(), false);

        let violations = enforce_policies(&registry, &opened, false, &telemetry()).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].is_security_critical());

        assert!(matches!(
            enforce_policies(&registry, &opened, true, &telemetry()),
            Err(StorageError::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_forbidden_box_opened_encrypted_is_violation() {
        let registry = BoxRegistry::new();
        registry
            .register(BoxDescriptor::new("meta", EncryptionPolicy::Forbidden, 1, 1))
            .unwrap();
        let mut opened = BTreeMap::new();
        opened.insert("meta".to_string(), true);

        let violations = enforce_policies(&registry, &opened, false, &telemetry()).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(!violations[0].is_security_critical());
    }

    #[test]
    fn test_optional_box_never_violates() {
        let registry = BoxRegistry::new();
        registry
            .register(BoxDescriptor::new("idx", EncryptionPolicy::Optional, 1, 1))
            .unwrap();
        for encrypted in [true, false] {
            let mut opened = BTreeMap::new();
            opened.insert("idx".to_string(), encrypted);
            assert!(enforce_policies(&registry, &opened, true, &telemetry())
                .unwrap()
                .is_empty());
        }
    }
}
