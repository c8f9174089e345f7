//! Confirmed, audited repair actions
//!
//! Four idempotent actions, each gated behind a time-limited
//! confirmation token bound to the action name. Every invocation emits
//! started/completed/error audit records carrying before/after state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use vital_core::{AuditPhase, AuditRecord, AuditSink, TelemetrySink};
use vital_journal::TransactionJournal;
use vital_queue::PendingQueue;
use vital_storage::{enforce_policies, StorageEngine};

/// Token lifetime.
const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// The available repair actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairAction {
    /// Rebuild the pending index from the op store
    RebuildIndex,
    /// Re-enqueue non-archived failed operations
    RetryFailedOps,
    /// Re-validate every box against its encryption policy
    VerifyEncryption,
    /// Compact every box file and prune the journal
    CompactBoxes,
}

impl RepairAction {
    /// Stable action name used in tokens and audit records.
    pub fn name(self) -> &'static str {
        match self {
            RepairAction::RebuildIndex => "rebuild_index",
            RepairAction::RetryFailedOps => "retry_failed_ops",
            RepairAction::VerifyEncryption => "verify_encryption",
            RepairAction::CompactBoxes => "compact_boxes",
        }
    }
}

/// A time-limited confirmation for one action.
#[derive(Debug, Clone)]
pub struct RepairToken {
    /// The action this token confirms
    pub action: RepairAction,
    /// Opaque token value
    pub token: Uuid,
    /// Issue time; the token expires five minutes later
    pub issued_at: DateTime<Utc>,
}

/// Result of a repair run.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// The action that ran
    pub action: RepairAction,
    /// Action-specific details (counts, violations, sizes)
    pub metadata: serde_json::Value,
}

/// Repair failures.
#[derive(Debug, Error)]
pub enum RepairError {
    /// The token was never issued or was already used
    #[error("unknown repair token")]
    UnknownToken,

    /// The token is older than its five-minute lifetime
    #[error("repair token expired")]
    TokenExpired,

    /// The token confirms a different action
    #[error("repair token was issued for '{issued_for}', not '{requested}'")]
    ActionMismatch {
        /// Action the token was bound to
        issued_for: &'static str,
        /// Action the caller asked to run
        requested: &'static str,
    },

    /// The underlying action failed
    #[error("repair action failed: {0}")]
    ActionFailed(String),
}

/// The repair toolkit.
pub struct RepairToolkit {
    queue: Arc<PendingQueue>,
    engine: Arc<StorageEngine>,
    journal: Arc<TransactionJournal>,
    strict_encryption: bool,
    audit: Arc<dyn AuditSink>,
    telemetry: Arc<dyn TelemetrySink>,
    outstanding: Mutex<HashMap<Uuid, RepairToken>>,
}

impl RepairToolkit {
    /// Assemble the toolkit.
    pub fn new(
        queue: Arc<PendingQueue>,
        engine: Arc<StorageEngine>,
        journal: Arc<TransactionJournal>,
        strict_encryption: bool,
        audit: Arc<dyn AuditSink>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        RepairToolkit {
            queue,
            engine,
            journal,
            strict_encryption,
            audit,
            telemetry,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a confirmation token for an action.
    pub fn issue_token(&self, action: RepairAction) -> RepairToken {
        let token = RepairToken {
            action,
            token: Uuid::new_v4(),
            issued_at: Utc::now(),
        };
        self.outstanding.lock().insert(token.token, token.clone());
        token
    }

    /// Run an action under a previously issued token.
    ///
    /// Tokens are single-use and expire after five minutes. Every action
    /// is safe to repeat.
    pub fn run(&self, action: RepairAction, token: &RepairToken) -> Result<RepairOutcome, RepairError> {
        self.redeem(action, token)?;

        let before = self.state_summary();
        self.audit(action, AuditPhase::Started, json!({ "before": before }));

        let result = self.execute(action);
        match &result {
            Ok(outcome) => {
                self.audit(
                    action,
                    AuditPhase::Completed,
                    json!({
                        "before": before,
                        "after": self.state_summary(),
                        "metadata": outcome.metadata,
                    }),
                );
            }
            Err(e) => {
                self.audit(
                    action,
                    AuditPhase::Error,
                    json!({ "before": before, "error": e.to_string() }),
                );
            }
        }
        result
    }

    fn redeem(&self, action: RepairAction, token: &RepairToken) -> Result<(), RepairError> {
        let mut outstanding = self.outstanding.lock();
        let issued = outstanding
            .remove(&token.token)
            .ok_or(RepairError::UnknownToken)?;
        if issued.action != action {
            return Err(RepairError::ActionMismatch {
                issued_for: issued.action.name(),
                requested: action.name(),
            });
        }
        let age = Utc::now() - issued.issued_at;
        let ttl = chrono::Duration::from_std(TOKEN_TTL).unwrap_or_else(|_| chrono::Duration::seconds(300));
        if age >= ttl {
            return Err(RepairError::TokenExpired);
        }
        Ok(())
    }

    fn execute(&self, action: RepairAction) -> Result<RepairOutcome, RepairError> {
        let metadata = match action {
            RepairAction::RebuildIndex => {
                let entries = self
                    .queue
                    .rebuild_index()
                    .map_err(|e| RepairError::ActionFailed(e.to_string()))?;
                json!({ "index_entries": entries })
            }
            RepairAction::RetryFailedOps => {
                let retried = self
                    .queue
                    .reenqueue_failed()
                    .map_err(|e| RepairError::ActionFailed(e.to_string()))?;
                json!({ "retried": retried })
            }
            RepairAction::VerifyEncryption => {
                let opened = self
                    .engine
                    .registry()
                    .all()
                    .iter()
                    .filter_map(|d| {
                        self.engine
                            .get_box(&d.name)
                            .ok()
                            .map(|h| (d.name.clone(), h.is_encrypted()))
                    })
                    .collect();
                let violations = enforce_policies(
                    self.engine.registry(),
                    &opened,
                    // Verification reports; it never aborts a running app.
                    false,
                    &self.telemetry,
                )
                .map_err(|e| RepairError::ActionFailed(e.to_string()))?;
                json!({
                    "strict_mode": self.strict_encryption,
                    "violations": violations,
                })
            }
            RepairAction::CompactBoxes => {
                let pruned = self
                    .journal
                    .prune()
                    .map_err(|e| RepairError::ActionFailed(e.to_string()))?;
                let mut compacted = 0;
                for descriptor in self.engine.registry().all() {
                    self.engine
                        .compact(&descriptor.name)
                        .map_err(|e| RepairError::ActionFailed(e.to_string()))?;
                    compacted += 1;
                }
                json!({ "boxes_compacted": compacted, "journal_entries_pruned": pruned })
            }
        };
        Ok(RepairOutcome { action, metadata })
    }

    fn state_summary(&self) -> serde_json::Value {
        json!({
            "pending": self.queue.pending_count(),
            "failed": self.queue.failed().len(),
            "journal_entries": self.journal.len(),
        })
    }

    fn audit(&self, action: RepairAction, phase: AuditPhase, details: serde_json::Value) {
        self.audit.record(&AuditRecord {
            action: action.name().to_string(),
            phase,
            at: Utc::now(),
            details,
        });
    }
}
