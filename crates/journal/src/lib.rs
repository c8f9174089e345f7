//! Transaction journal for vitalstore
//!
//! Multi-box writes go through [`TransactionJournal::execute`], which
//! makes them atomic across crashes:
//!
//! 1. An intention entry (the full op list) is appended to the journal
//!    box and synced. Failure here aborts with no state change.
//! 2. The ops are applied to their boxes.
//! 3. The entry is marked committed.
//!
//! If the process dies between 1 and 3, startup [`recover`] re-applies
//! the intention. That is safe because ops are keyed puts and deletes,
//! so replay is idempotent. If it dies before 1 completes, the torn journal
//! append is dropped by the box-file replay and the transaction never
//! happened.
//!
//! Committed entries are dead weight; [`prune`] drops them during
//! compaction passes.
//!
//! [`recover`]: TransactionJournal::recover
//! [`prune`]: TransactionJournal::prune

#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use vital_core::{Counter, TelemetrySink};
use vital_storage::{BoxHandle, StorageEngine, StorageError};

/// Name of the journal's own box.
pub const JOURNAL_BOX: &str = "journal";

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Policy violation (unknown box, oversized batch); nothing written
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The intention record could not be written; nothing changed
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// A box write failed after the intention was durable.
    ///
    /// State may be partially applied in memory, but the durable
    /// intention guarantees startup recovery completes the transaction.
    #[error("transaction apply failed (will recover on restart): {0}")]
    ApplyFailed(String),

    /// Other storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result alias for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// One mutation inside a transaction.
///
/// Values are already-encoded record bytes; the journal treats them as
/// opaque, which keeps replay independent of the encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Insert or overwrite a record
    Write {
        /// Target box
        box_name: String,
        /// Record key
        key: String,
        /// Encoded record bytes
        value: Vec<u8>,
    },
    /// Remove a record
    Delete {
        /// Target box
        box_name: String,
        /// Record key
        key: String,
    },
}

impl JournalOp {
    /// The box this op touches.
    pub fn box_name(&self) -> &str {
        match self {
            JournalOp::Write { box_name, .. } => box_name,
            JournalOp::Delete { box_name, .. } => box_name,
        }
    }
}

/// A journal entry: an intention plus its commit flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JournalEntry {
    id: Uuid,
    ops: Vec<JournalOp>,
    created_at: DateTime<Utc>,
    committed: bool,
}

/// The transaction journal.
pub struct TransactionJournal {
    engine: Arc<StorageEngine>,
    journal_box: Arc<BoxHandle>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl TransactionJournal {
    /// Wrap the engine; the journal box must already be open.
    pub fn new(engine: Arc<StorageEngine>, telemetry: Arc<dyn TelemetrySink>) -> Result<Self> {
        let journal_box = engine.get_box(JOURNAL_BOX)?;
        Ok(TransactionJournal {
            engine,
            journal_box,
            telemetry,
        })
    }

    /// Execute a transaction: all ops become visible, or none do.
    pub fn execute(&self, ops: Vec<JournalOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            if self.engine.get_box(op.box_name()).is_err() {
                return Err(JournalError::Rejected(format!(
                    "unknown box '{}'",
                    op.box_name()
                )));
            }
            if op.box_name() == JOURNAL_BOX {
                return Err(JournalError::Rejected(
                    "transactions may not touch the journal box".into(),
                ));
            }
        }

        let entry = JournalEntry {
            id: Uuid::new_v4(),
            ops,
            created_at: Utc::now(),
            committed: false,
        };
        let key = entry.id.to_string();
        let bytes = encode_entry(&entry)?;

        // Intention first. If this write fails the transaction never
        // existed and the caller sees unchanged state.
        self.journal_box
            .put_raw(&key, bytes)
            .map_err(|e| JournalError::Aborted(e.to_string()))?;

        self.apply(&entry)?;
        self.mark_committed(entry)?;
        Ok(())
    }

    /// Replay uncommitted intentions left by a crash.
    ///
    /// Returns how many entries were replayed. Entries that fail to
    /// decode are dropped with an error log; their intention is
    /// unknowable.
    pub fn recover(&self) -> Result<usize> {
        let mut pending: Vec<JournalEntry> = Vec::new();
        for key in self.journal_box.keys() {
            let Some(raw) = self.journal_box.get_raw(&key) else {
                continue;
            };
            match bincode::deserialize::<JournalEntry>(&raw) {
                Ok(entry) if !entry.committed => pending.push(entry),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        entry = %key,
                        error = %e,
                        "undecodable journal entry dropped"
                    );
                    self.journal_box.delete_raw(&key)?;
                }
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let count = pending.len();
        for entry in pending {
            tracing::info!(
                entry = %entry.id,
                ops = entry.ops.len(),
                "replaying uncommitted transaction"
            );
            self.apply(&entry)?;
            self.mark_committed(entry)?;
            self.telemetry.incr(Counter::JournalReplay);
        }
        Ok(count)
    }

    /// Crash-test support: append an intention without applying or
    /// committing it, exactly as a crash between the journal write and
    /// the box writes would leave the store. Recovery must replay it.
    pub fn append_intent_unapplied(&self, ops: Vec<JournalOp>) -> Result<Uuid> {
        let entry = JournalEntry {
            id: Uuid::new_v4(),
            ops,
            created_at: Utc::now(),
            committed: false,
        };
        let key = entry.id.to_string();
        let bytes = encode_entry(&entry)?;
        self.journal_box
            .put_raw(&key, bytes)
            .map_err(|e| JournalError::Aborted(e.to_string()))?;
        Ok(entry.id)
    }

    /// Drop committed entries; returns how many were pruned.
    pub fn prune(&self) -> Result<usize> {
        let mut pruned = 0;
        for key in self.journal_box.keys() {
            let Some(raw) = self.journal_box.get_raw(&key) else {
                continue;
            };
            if let Ok(entry) = bincode::deserialize::<JournalEntry>(&raw) {
                if entry.committed {
                    self.journal_box.delete_raw(&key)?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Number of entries currently in the journal box.
    pub fn len(&self) -> usize {
        self.journal_box.len()
    }

    /// Whether the journal box is empty.
    pub fn is_empty(&self) -> bool {
        self.journal_box.is_empty()
    }

    fn apply(&self, entry: &JournalEntry) -> Result<()> {
        for op in &entry.ops {
            let result = match op {
                JournalOp::Write {
                    box_name,
                    key,
                    value,
                } => self.engine.apply_put(box_name, key, value.clone()),
                JournalOp::Delete { box_name, key } => self.engine.apply_delete(box_name, key),
            };
            result.map_err(|e| JournalError::ApplyFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn mark_committed(&self, mut entry: JournalEntry) -> Result<()> {
        entry.committed = true;
        let key = entry.id.to_string();
        let bytes = encode_entry(&entry)?;
        // A failure here leaves the entry uncommitted; replay at next
        // startup re-applies the same keyed ops, which is harmless.
        if let Err(e) = self.journal_box.put_raw(&key, bytes) {
            tracing::warn!(entry = %key, error = %e, "commit mark failed; will replay");
        }
        Ok(())
    }
}

fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| JournalError::Aborted(format!("encode: {}", e)))
}
