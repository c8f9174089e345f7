//! Operation data model
//!
//! An [`Operation`] is the unit of work the queues persist and dispatch:
//! a keyed, prioritized, retryable record whose payload is opaque to the
//! core. Operations are created by callers at enqueue time, mutated only
//! by the dispatchers while the processing lock is held, and destroyed on
//! delivery acknowledgement, on migration to the failed-op store, or on
//! patient-data deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Minimum length for a caller-supplied idempotency key.
pub const MIN_IDEMPOTENCY_KEY_LEN: usize = 8;

/// Dispatch priority for an operation.
///
/// Ordered by urgency: `Emergency` sorts before `High` before `Normal`
/// before `Low`. Emergency operations travel through the fast lane and
/// bypass eligibility backoff.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Life-critical operation, processed through the emergency lane
    Emergency,
    /// Processed before normal traffic
    High,
    /// Default priority
    Normal,
    /// Background traffic
    Low,
}

impl Priority {
    /// Ordinal used for the stable dispatch sort (0 = most urgent).
    pub fn ordinal(self) -> u8 {
        match self {
            Priority::Emergency => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Processing status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Waiting for its first attempt
    Pending,
    /// Currently handed to the consumer
    InProgress,
    /// Failed transiently, waiting for its backoff window
    Retry,
    /// Failed permanently (moved to the failed-op store)
    Failed,
    /// Delivered and acknowledged
    Completed,
    /// Emergency op that exhausted its attempts, kept for audit
    Escalated,
}

/// Delivery progress of an operation.
///
/// Transitions are monotonic: `Pending → Sent → Acknowledged`. An
/// operation is deleted from the pending store only once acknowledged
/// (or via the poison / permanent-failure path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Not yet handed to the consumer
    Pending,
    /// Handed off, awaiting acknowledgement
    Sent,
    /// Delivery confirmed
    Acknowledged,
}

impl DeliveryState {
    /// Advance to `next` if that is a forward transition.
    ///
    /// Returns `false` (leaving the state untouched) when `next` would
    /// move backwards.
    pub fn advance(&mut self, next: DeliveryState) -> bool {
        if next >= *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Per-entity ordering key in the form `<entity_type>:<entity_id>`.
///
/// Operations sharing an entity key are dispatched strictly FIFO and
/// never overlap in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Build an entity key from its two components.
    pub fn new(entity_type: impl AsRef<str>, entity_id: impl AsRef<str>) -> Self {
        EntityKey(format!("{}:{}", entity_type.as_ref(), entity_id.as_ref()))
    }

    /// Parse a raw `<entity_type>:<entity_id>` string.
    ///
    /// Returns `None` when either component is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let (ty, id) = raw.split_once(':')?;
        if ty.is_empty() || id.is_empty() {
            return None;
        }
        Some(EntityKey(raw.to_string()))
    }

    /// Derive an entity key from an operation payload.
    ///
    /// Looks for string-valued `entity_type` and `entity_id` fields.
    pub fn from_payload(payload: &BTreeMap<String, Value>) -> Option<Self> {
        let ty = payload.get("entity_type")?.as_str()?;
        let id = payload.get("entity_id")?.as_str()?;
        if ty.is_empty() || id.is_empty() {
            return None;
        }
        Some(EntityKey::new(ty, id))
    }

    /// The raw `<entity_type>:<entity_id>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation failures raised at enqueue time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpValidationError {
    /// The operation id is empty
    #[error("operation id must not be empty")]
    EmptyId,

    /// The idempotency key is empty or shorter than the minimum
    #[error("idempotency key must be at least {MIN_IDEMPOTENCY_KEY_LEN} characters, got {0}")]
    IdempotencyKeyTooShort(usize),

    /// The schema version is below 1
    #[error("schema version must be >= 1")]
    SchemaVersionZero,
}

/// The unit of work carried by the pending and emergency queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id; primary key and default idempotency key
    pub id: String,
    /// Free-form operation type (`"create"`, `"delete"`, ...)
    pub op_type: String,
    /// Client-chosen dedup key; defaults to `id`
    pub idempotency_key: String,
    /// Opaque payload interpreted by downstream consumers
    pub payload: BTreeMap<String, Value>,
    /// Number of completed delivery attempts
    pub attempts: u32,
    /// Processing status
    pub status: OpStatus,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// Timestamp of the most recent attempt
    pub last_tried_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run; set iff `attempts > 0`
    /// for non-emergency operations
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Schema version of the payload record
    pub schema_version: u32,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Last mutation time (UTC)
    pub updated_at: DateTime<Utc>,
    /// Per-entity ordering key; derived from the payload when absent
    pub entity_key: Option<EntityKey>,
    /// Dispatch priority
    pub priority: Priority,
    /// Delivery progress
    pub delivery_state: DeliveryState,
}

impl Operation {
    /// Create a new pending operation with defaults.
    ///
    /// The idempotency key defaults to the operation id; callers with
    /// short ids must supply an explicit key of at least
    /// [`MIN_IDEMPOTENCY_KEY_LEN`] characters.
    pub fn new(
        id: impl Into<String>,
        op_type: impl Into<String>,
        payload: BTreeMap<String, Value>,
        priority: Priority,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        let entity_key = EntityKey::from_payload(&payload);
        Operation {
            idempotency_key: id.clone(),
            id,
            op_type: op_type.into(),
            payload,
            attempts: 0,
            status: OpStatus::Pending,
            last_error: None,
            last_tried_at: None,
            next_eligible_at: None,
            schema_version: 1,
            created_at: now,
            updated_at: now,
            entity_key,
            priority,
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Set an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Set an explicit entity key.
    pub fn with_entity_key(mut self, key: EntityKey) -> Self {
        self.entity_key = Some(key);
        self
    }

    /// Validate enqueue-time invariants.
    pub fn validate(&self) -> Result<(), OpValidationError> {
        if self.id.is_empty() {
            return Err(OpValidationError::EmptyId);
        }
        if self.idempotency_key.len() < MIN_IDEMPOTENCY_KEY_LEN {
            return Err(OpValidationError::IdempotencyKeyTooShort(
                self.idempotency_key.len(),
            ));
        }
        if self.schema_version == 0 {
            return Err(OpValidationError::SchemaVersionZero);
        }
        Ok(())
    }

    /// Entity key, deriving from the payload when not set explicitly.
    pub fn effective_entity_key(&self) -> Option<EntityKey> {
        self.entity_key
            .clone()
            .or_else(|| EntityKey::from_payload(&self.payload))
    }

    /// Whether the operation may be attempted at `now`.
    ///
    /// Emergency operations bypass the backoff window entirely.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        if self.priority == Priority::Emergency {
            return true;
        }
        match self.next_eligible_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Record a failed attempt.
    ///
    /// Increments the attempt counter, stores the error message and the
    /// next eligibility time, and flips the status to [`OpStatus::Retry`].
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        next_eligible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.last_tried_at = Some(now);
        self.next_eligible_at = next_eligible_at;
        self.status = OpStatus::Retry;
        self.updated_at = now;
    }
}

/// Frozen snapshot of an operation that exhausted its attempts or failed
/// permanently.
///
/// Immutable except for the archival flag. The failed-op store is
/// bounded; oldest archived entries evict first when over the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOp {
    /// The operation as it looked at failure time
    pub op: Operation,
    /// Canonical error code (e.g. `"POISON_OP"`)
    pub error_code: String,
    /// Human-readable error message
    pub error_message: String,
    /// When the operation was moved here
    pub failed_at: DateTime<Utc>,
    /// Archival flag; archived entries are eviction candidates
    pub archived: bool,
}

impl FailedOp {
    /// Freeze `op` with the given error code and message.
    pub fn freeze(
        mut op: Operation,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        op.status = OpStatus::Failed;
        op.updated_at = now;
        FailedOp {
            op,
            error_code: error_code.into(),
            error_message: error_message.into(),
            failed_at: now,
            archived: false,
        }
    }
}
