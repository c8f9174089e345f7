//! The pending-queue dispatcher
//!
//! State machine: `Idle → Processing → (Idle | Blocked | Paused |
//! Error)`. A processing pass:
//!
//! 1. refuses to start unless the state allows it,
//! 2. takes the processing lock (or goes `Blocked`),
//! 3. runs the cleanup passes (idempotency TTL, expired entity locks,
//!    index integrity),
//! 4. fetches twice the batch from the index and stable-sorts by
//!    (priority ordinal, created_at),
//! 5. walks the batch through eligibility, poison isolation and entity
//!    locking, hands survivors to the consumer, and settles each
//!    outcome atomically through the journal,
//! 6. releases the lock and lands in `Idle` (or `Paused` after an auth
//!    failure, `Error` after a storage failure).
//!
//! Priority is strict between levels and FIFO within a level. Entity
//! FIFO holds across levels because a blocked entity skips rather than
//! reorders.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vital_core::{
    CloudMirror, Counter, DeliveryState, FailureClass, OpStatus, Operation, Priority, QueueConfig,
    SyncConsumer, SyncOutcome, TelemetrySink,
};
use vital_journal::{JournalOp, TransactionJournal};
use vital_storage::{meta_keys, MetaStore, StorageEngine, TypedBox};

use crate::backoff::backoff_delay;
use crate::boxes::{
    ENTITY_LOCKS_BOX, FAILED_OPS_BOX, IDEMPOTENCY_BOX, PENDING_INDEX_BOX, PENDING_OPS_BOX,
};
use crate::emergency::EmergencyQueue;
use crate::entity::EntityOrdering;
use crate::error::Result;
use crate::failed::FailedOpStore;
use crate::idempotency::IdempotencyCache;
use crate::index::PendingIndex;
use crate::lock::ProcessingLock;
use crate::POISON_ERROR_CODE;

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Ready to process
    Idle,
    /// A pass is running
    Processing,
    /// The processing lock was held elsewhere
    Blocked,
    /// An auth failure paused the queue; requires [`PendingQueue::resume`]
    Paused,
    /// A storage failure ended the last pass; the next pass may retry
    Error,
}

impl QueueState {
    /// Whether a new pass may start from this state.
    pub fn can_start_processing(self) -> bool {
        matches!(
            self,
            QueueState::Idle | QueueState::Blocked | QueueState::Error
        )
    }
}

/// The priority dispatcher for normal operations.
pub struct PendingQueue {
    ops: TypedBox<Operation>,
    index: PendingIndex,
    idempotency: IdempotencyCache,
    entities: EntityOrdering,
    lock: ProcessingLock,
    failed: FailedOpStore,
    journal: Arc<TransactionJournal>,
    meta: MetaStore,
    consumer: Arc<dyn SyncConsumer>,
    emergency: Option<Arc<EmergencyQueue>>,
    mirror: Option<Arc<dyn CloudMirror>>,
    telemetry: Arc<dyn TelemetrySink>,
    config: QueueConfig,
    state: RwLock<QueueState>,
    holder_id: String,
}

impl PendingQueue {
    /// Assemble the dispatcher over already-opened boxes.
    pub fn new(
        engine: &Arc<StorageEngine>,
        journal: Arc<TransactionJournal>,
        meta: MetaStore,
        consumer: Arc<dyn SyncConsumer>,
        config: QueueConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        Ok(PendingQueue {
            ops: engine.typed(PENDING_OPS_BOX)?,
            index: PendingIndex::new(engine.typed(PENDING_INDEX_BOX)?),
            idempotency: IdempotencyCache::new(
                engine.typed(IDEMPOTENCY_BOX)?,
                config.idempotency_ttl,
            ),
            entities: EntityOrdering::new(
                engine.typed(ENTITY_LOCKS_BOX)?,
                config.entity_lock_timeout,
            ),
            lock: ProcessingLock::new(
                meta.clone(),
                config.processing_lock_timeout,
                telemetry.clone(),
            ),
            failed: FailedOpStore::new(engine.typed(FAILED_OPS_BOX)?, config.failed_store_limit),
            journal,
            meta,
            consumer,
            emergency: None,
            mirror: None,
            telemetry,
            config,
            state: RwLock::new(QueueState::Idle),
            holder_id: format!("dispatch-{}", Uuid::new_v4()),
        })
    }

    /// Wire the emergency fast lane.
    pub fn with_emergency_lane(mut self, lane: Arc<EmergencyQueue>) -> Self {
        self.emergency = Some(lane);
        self
    }

    /// Wire the cloud mirror.
    pub fn with_mirror(mut self, mirror: Arc<dyn CloudMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Enqueue an operation.
    ///
    /// Returns `false` when the idempotency key was seen within the TTL;
    /// nothing is written in that case. Emergency operations route to
    /// the fast lane when one is wired.
    pub async fn enqueue(&self, mut op: Operation) -> Result<bool> {
        op.validate()?;
        if op.entity_key.is_none() {
            op.entity_key = op.effective_entity_key();
        }
        let now = Utc::now();
        if self.idempotency.contains(&op.idempotency_key, now) {
            self.telemetry.incr(Counter::IdempotencyRejected);
            return Ok(false);
        }

        if op.priority == Priority::Emergency {
            if let Some(lane) = &self.emergency {
                lane.enqueue(op.clone())?;
                self.idempotency.record(&op.idempotency_key, now)?;
                self.mirror_one(&op).await;
                return Ok(true);
            }
        }

        let write = JournalOp::Write {
            box_name: PENDING_OPS_BOX.to_string(),
            key: op.id.clone(),
            value: self.ops.encode_value(&op)?,
        };
        let index_write = self.index.insert_op(&op.id)?;
        self.journal.execute(vec![write, index_write])?;
        self.idempotency.record(&op.idempotency_key, now)?;
        self.mirror_one(&op).await;
        Ok(true)
    }

    /// Run one processing pass; returns consumer invocations.
    pub async fn process(&self, batch_size: usize) -> Result<usize> {
        if !self.state().can_start_processing() {
            tracing::debug!(state = ?self.state(), "processing refused by state");
            return Ok(0);
        }
        self.set_state(QueueState::Processing);
        self.consumer.on_queue_start().await;

        if !self.lock.try_acquire(&self.holder_id, Utc::now()) {
            self.set_state(QueueState::Blocked);
            self.consumer.on_queue_end().await;
            return Ok(0);
        }

        let result = self.run_pass(batch_size).await;
        self.lock.release(&self.holder_id);
        match &result {
            Ok((_, paused)) => self.set_state(if *paused {
                QueueState::Paused
            } else {
                QueueState::Idle
            }),
            Err(e) => {
                tracing::error!(error = %e, "processing pass failed");
                self.set_state(QueueState::Error);
            }
        }
        self.consumer.on_queue_end().await;
        result.map(|(processed, _)| processed)
    }

    /// Complete a delivery whose acknowledgement arrived out of band.
    pub async fn acknowledge(&self, op_id: &str) -> Result<bool> {
        let Some(mut op) = self.ops.get(op_id)? else {
            return Ok(false);
        };
        op.delivery_state.advance(DeliveryState::Acknowledged);
        let mut ops = vec![JournalOp::Delete {
            box_name: PENDING_OPS_BOX.to_string(),
            key: op.id.clone(),
        }];
        ops.extend(self.index.remove_op(&op.id));
        self.journal.execute(ops)?;
        Ok(true)
    }

    /// Current dispatcher state.
    pub fn state(&self) -> QueueState {
        *self.state.read()
    }

    /// Lift a pause set by an auth failure.
    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == QueueState::Paused {
            *state = QueueState::Idle;
        }
        drop(state);
        self.persist_state();
    }

    /// Operations waiting in the pending store.
    pub fn pending_count(&self) -> usize {
        self.ops.len()
    }

    /// Age of the oldest pending operation.
    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let oldest_id = self.index.oldest(1).into_iter().next()?;
        let op = self.ops.get(&oldest_id).ok().flatten()?;
        (now - op.created_at).to_std().ok()
    }

    /// Rebuild the pending index from the op store.
    pub fn rebuild_index(&self) -> Result<usize> {
        self.index.rebuild(&self.ops)
    }

    /// The failed-op store.
    pub fn failed(&self) -> &FailedOpStore {
        &self.failed
    }

    /// Move every non-archived failed op back into the pending queue
    /// with a fresh attempt budget.
    ///
    /// Bypasses the idempotency cache (the keys are still within the
    /// TTL from the original enqueue). Idempotent: each retried op
    /// leaves the failed store, so a re-run with nothing failed is a
    /// no-op.
    pub fn reenqueue_failed(&self) -> Result<usize> {
        let now = Utc::now();
        let mut retried = 0;
        for failed in self.failed.list() {
            if failed.archived {
                continue;
            }
            let mut op = failed.op.clone();
            op.attempts = 0;
            op.status = OpStatus::Pending;
            op.next_eligible_at = None;
            op.last_error = None;
            op.updated_at = now;

            let mut ops = vec![JournalOp::Write {
                box_name: PENDING_OPS_BOX.to_string(),
                key: op.id.clone(),
                value: self.ops.encode_value(&op)?,
            }];
            ops.push(self.index.insert_op(&op.id)?);
            ops.push(JournalOp::Delete {
                box_name: FAILED_OPS_BOX.to_string(),
                key: op.id.clone(),
            });
            self.journal.execute(ops)?;
            retried += 1;
        }
        Ok(retried)
    }

    /// The processing lock.
    pub fn processing_lock(&self) -> &ProcessingLock {
        &self.lock
    }

    /// Entity locks currently held.
    pub fn entity_locks_held(&self) -> usize {
        self.entities.locked_count()
    }

    async fn run_pass(&self, batch_size: usize) -> Result<(usize, bool)> {
        let now = Utc::now();
        if let Err(e) = self.idempotency.cleanup(now) {
            tracing::warn!(error = %e, "idempotency cleanup failed");
        }
        self.entities.cleanup_expired(now);
        self.index.integrity_check_and_rebuild(&self.ops)?;

        let mut candidates: Vec<Operation> = self
            .index
            .oldest(batch_size.saturating_mul(2))
            .iter()
            .filter_map(|id| self.ops.get(id).ok().flatten())
            .collect();
        // Stable: FIFO survives within each priority level.
        candidates.sort_by(|a, b| {
            a.priority
                .ordinal()
                .cmp(&b.priority.ordinal())
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut processed = 0;
        let mut paused = false;
        // Locks of ops that stay in flight (retry, awaiting ack) are
        // released only at the end of the pass: a later op on the same
        // entity must not overtake them within this pass.
        let mut deferred_releases: Vec<Operation> = Vec::new();
        for op in candidates {
            if processed >= batch_size {
                break;
            }
            let now = Utc::now();
            if !op.is_eligible_at(now) {
                continue;
            }
            if op.delivery_state == DeliveryState::Sent && op.status == OpStatus::InProgress {
                // Delivered, waiting for acknowledgement; redelivery
                // would double-send.
                continue;
            }
            if op.attempts >= self.config.max_attempts {
                self.isolate_poison(op)?;
                continue;
            }
            if !self.entities.try_acquire(&op, now) {
                self.telemetry.incr(Counter::EntityBlocked);
                continue;
            }

            processed += 1;
            let outcome = self.consumer.process(&op).await;
            let completed = matches!(
                outcome,
                SyncOutcome::Success | SyncOutcome::PermanentFailure(..)
            );
            let settled = self.settle(&op, outcome).await;
            if completed || settled.is_err() {
                self.entities.release(&op);
            } else {
                deferred_releases.push(op);
            }
            match settled {
                Ok(paused_now) => paused |= paused_now,
                Err(e) => {
                    for held in &deferred_releases {
                        self.entities.release(held);
                    }
                    return Err(e);
                }
            }
            if paused {
                // Auth is broken; delivering the rest of the batch
                // would only burn attempts.
                break;
            }
        }
        for op in &deferred_releases {
            self.entities.release(op);
        }
        Ok((processed, paused))
    }

    /// Apply one consumer outcome atomically. Returns whether the queue
    /// should pause.
    async fn settle(&self, op: &Operation, outcome: SyncOutcome) -> Result<bool> {
        let now = Utc::now();
        match outcome {
            SyncOutcome::Success => {
                let mut done = op.clone();
                done.delivery_state.advance(DeliveryState::Sent);
                done.delivery_state.advance(DeliveryState::Acknowledged);
                done.status = OpStatus::Completed;
                let mut ops = vec![JournalOp::Delete {
                    box_name: PENDING_OPS_BOX.to_string(),
                    key: done.id.clone(),
                }];
                ops.extend(self.index.remove_op(&done.id));
                self.journal.execute(ops)?;
                Ok(false)
            }
            SyncOutcome::AckPending => {
                let mut sent = op.clone();
                sent.delivery_state.advance(DeliveryState::Sent);
                sent.status = OpStatus::InProgress;
                sent.updated_at = now;
                self.write_back(&sent)?;
                Ok(false)
            }
            SyncOutcome::TransientFailure(message) => {
                let mut retry = op.clone();
                let delay = backoff_delay(
                    retry.attempts,
                    self.config.backoff_base,
                    self.config.backoff_cap,
                );
                let next = now + chrono::Duration::from_std(delay).unwrap_or_default();
                retry.record_failure(message, Some(next), now);
                self.telemetry.incr(Counter::TransientFailure);
                if retry.attempts >= self.config.max_attempts {
                    // The failure that exhausted the budget isolates
                    // immediately; the op never waits out another backoff.
                    self.isolate_poison(retry)?;
                } else {
                    self.write_back(&retry)?;
                }
                Ok(false)
            }
            SyncOutcome::PermanentFailure(class, message) => {
                let mut ops = vec![JournalOp::Delete {
                    box_name: PENDING_OPS_BOX.to_string(),
                    key: op.id.clone(),
                }];
                ops.extend(self.index.remove_op(&op.id));
                ops.push(
                    self.failed
                        .freeze_op(op.clone(), class.error_code(), &message)?,
                );
                self.journal.execute(ops)?;
                self.failed.enforce_limit()?;
                self.telemetry.incr(Counter::PermanentFailure);
                Ok(class == FailureClass::Auth)
            }
        }
    }

    fn isolate_poison(&self, op: Operation) -> Result<()> {
        tracing::warn!(op_id = %op.id, attempts = op.attempts, "isolating poison op");
        let mut ops = vec![JournalOp::Delete {
            box_name: PENDING_OPS_BOX.to_string(),
            key: op.id.clone(),
        }];
        ops.extend(self.index.remove_op(&op.id));
        ops.push(self.failed.freeze_op(
            op,
            POISON_ERROR_CODE,
            "exceeded maximum delivery attempts",
        )?);
        self.journal.execute(ops)?;
        self.failed.enforce_limit()?;
        self.telemetry.incr(Counter::PoisonOpIsolated);
        Ok(())
    }

    fn write_back(&self, op: &Operation) -> Result<()> {
        self.journal.execute(vec![JournalOp::Write {
            box_name: PENDING_OPS_BOX.to_string(),
            key: op.id.clone(),
            value: self.ops.encode_value(op)?,
        }])?;
        Ok(())
    }

    async fn mirror_one(&self, op: &Operation) {
        if let Some(mirror) = &self.mirror {
            mirror.mirror(op).await;
        }
    }

    fn set_state(&self, next: QueueState) {
        *self.state.write() = next;
        self.persist_state();
    }

    fn persist_state(&self) {
        let state = *self.state.read();
        self.meta.put(meta_keys::QUEUE_STATE, &state);
    }
}
