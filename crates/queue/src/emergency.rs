//! Emergency fast lane
//!
//! Life-critical operations get their own store and an aggressive retry
//! loop, so a stuck normal queue can never block them. Failures are not
//! classified here: any failure increments the attempt counter, and an
//! operation that exhausts its attempts is marked escalated, kept for
//! audit, and reported through the escalation sink.

use chrono::{DateTime, Utc};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use vital_core::{
    Counter, DeliveryState, EscalationSink, OpStatus, Operation, Priority, QueueConfig,
    SyncConsumer, SyncOutcome, TelemetrySink,
};
use vital_storage::TypedBox;

use crate::backoff::backoff_delay;
use crate::error::{QueueError, Result};

/// Signals the safety fallback machine consumes.
pub trait EmergencySignal: Send + Sync {
    /// An emergency delivery succeeded.
    fn emergency_success(&self);

    /// An emergency delivery failed.
    fn emergency_failure(&self, op: &Operation);
}

/// Signal sink that drops everything (tests, headless installs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmergencySignal;

impl EmergencySignal for NoopEmergencySignal {
    fn emergency_success(&self) {}
    fn emergency_failure(&self, _op: &Operation) {}
}

/// Events emitted by the fast lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyEvent {
    /// An operation entered the lane
    Enqueued {
        /// Operation id
        op_id: String,
    },
    /// An operation was delivered and removed
    Processed {
        /// Operation id
        op_id: String,
    },
    /// An operation exhausted its attempts
    Escalated {
        /// Operation id
        op_id: String,
    },
    /// The retry timer started a pass
    RetryLoopTriggered,
    /// A caller asked for an immediate pass
    ImmediateProcessingRequested,
}

/// The emergency queue.
pub struct EmergencyQueue {
    ops: TypedBox<Operation>,
    config: QueueConfig,
    consumer: Arc<dyn SyncConsumer>,
    escalation: Arc<dyn EscalationSink>,
    signal: Arc<dyn EmergencySignal>,
    telemetry: Arc<dyn TelemetrySink>,
    events: broadcast::Sender<EmergencyEvent>,
}

impl EmergencyQueue {
    /// Build the fast lane over its box.
    pub fn new(
        ops: TypedBox<Operation>,
        config: QueueConfig,
        consumer: Arc<dyn SyncConsumer>,
        escalation: Arc<dyn EscalationSink>,
        signal: Arc<dyn EmergencySignal>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        EmergencyQueue {
            ops,
            config,
            consumer,
            escalation,
            signal,
            telemetry,
            events,
        }
    }

    /// Subscribe to lane events.
    pub fn subscribe(&self) -> broadcast::Receiver<EmergencyEvent> {
        self.events.subscribe()
    }

    /// Accept an emergency operation into the lane.
    pub fn enqueue(&self, op: Operation) -> Result<()> {
        op.validate()?;
        if op.priority != Priority::Emergency {
            return Err(QueueError::NotEmergency(op.id));
        }
        self.ops.put(&op.id, &op)?;
        self.emit(EmergencyEvent::Enqueued { op_id: op.id });
        Ok(())
    }

    /// Process every eligible, non-escalated operation once.
    ///
    /// Returns the number of consumer invocations.
    pub async fn process_all(&self) -> Result<usize> {
        let now = Utc::now();
        let mut processed = 0;
        for op_id in self.ops.keys() {
            let Some(op) = self.ops.get(&op_id).ok().flatten() else {
                continue;
            };
            if op.status == OpStatus::Escalated || !Self::eligible(&op, now) {
                continue;
            }
            processed += 1;
            let outcome = self.consumer.process(&op).await;
            self.settle(op, outcome, Utc::now())?;
        }
        Ok(processed)
    }

    /// Ask for an immediate pass, outside the timer cadence.
    pub async fn request_immediate(&self) -> Result<usize> {
        self.emit(EmergencyEvent::ImmediateProcessingRequested);
        self.process_all().await
    }

    /// Complete a delivery whose acknowledgement arrived later.
    pub fn acknowledge(&self, op_id: &str) -> Result<bool> {
        match self.ops.get(op_id)? {
            Some(mut op) => {
                op.delivery_state.advance(DeliveryState::Acknowledged);
                self.ops.delete(op_id)?;
                self.emit(EmergencyEvent::Processed {
                    op_id: op_id.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Spawn the retry timer; the lane retries while eligible ops exist.
    ///
    /// The caller keeps the handle and aborts it on shutdown.
    pub fn spawn_retry_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let lane = self.clone();
        let period = lane.config.emergency_retry_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if lane.eligible_count(Utc::now()) == 0 {
                    continue;
                }
                lane.emit(EmergencyEvent::RetryLoopTriggered);
                if let Err(e) = lane.process_all().await {
                    tracing::error!(error = %e, "emergency retry pass failed");
                }
            }
        })
    }

    /// Operations currently in the lane (escalated included).
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the lane is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations eligible for an attempt right now.
    pub fn eligible_count(&self, now: DateTime<Utc>) -> usize {
        self.ops
            .keys()
            .iter()
            .filter_map(|k| self.ops.get(k).ok().flatten())
            .filter(|op| op.status != OpStatus::Escalated && Self::eligible(op, now))
            .count()
    }

    /// Escalated operations kept for audit.
    pub fn escalated_count(&self) -> usize {
        self.ops
            .keys()
            .iter()
            .filter_map(|k| self.ops.get(k).ok().flatten())
            .filter(|op| op.status == OpStatus::Escalated)
            .count()
    }

    fn settle(&self, mut op: Operation, outcome: SyncOutcome, now: DateTime<Utc>) -> Result<()> {
        match outcome {
            SyncOutcome::Success => {
                op.delivery_state.advance(DeliveryState::Sent);
                op.delivery_state.advance(DeliveryState::Acknowledged);
                self.ops.delete(&op.id)?;
                self.signal.emergency_success();
                self.emit(EmergencyEvent::Processed { op_id: op.id });
            }
            SyncOutcome::AckPending => {
                op.delivery_state.advance(DeliveryState::Sent);
                op.status = OpStatus::InProgress;
                op.updated_at = now;
                self.ops.put(&op.id.clone(), &op)?;
            }
            SyncOutcome::TransientFailure(message)
            | SyncOutcome::PermanentFailure(_, message) => {
                // The fast lane does not classify: every failure burns an
                // attempt, and exhaustion escalates instead of poisoning.
                let delay = backoff_delay(
                    op.attempts,
                    self.config.emergency_backoff_base,
                    self.config.emergency_backoff_cap,
                );
                let next = now + chrono::Duration::from_std(delay).unwrap_or_default();
                op.record_failure(message, Some(next), now);
                self.signal.emergency_failure(&op);

                if op.attempts >= self.config.emergency_max_attempts {
                    op.status = OpStatus::Escalated;
                    op.updated_at = now;
                    self.ops.put(&op.id.clone(), &op)?;
                    self.telemetry.incr(Counter::EmergencyEscalation);
                    self.invoke_escalation(&op);
                    self.emit(EmergencyEvent::Escalated { op_id: op.id });
                } else {
                    self.ops.put(&op.id.clone(), &op)?;
                }
            }
        }
        Ok(())
    }

    fn invoke_escalation(&self, op: &Operation) {
        let reason = format!(
            "emergency op exhausted {} attempts: {}",
            op.attempts,
            op.last_error.as_deref().unwrap_or("unknown")
        );
        let sink = self.escalation.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            sink.on_escalation(Some(op), &reason);
        }));
        if result.is_err() {
            tracing::error!(op_id = %op.id, "escalation sink panicked");
            self.telemetry.incr(Counter::EscalationSinkError);
        }
    }

    fn eligible(op: &Operation, now: DateTime<Utc>) -> bool {
        if op.status == OpStatus::InProgress && op.delivery_state == DeliveryState::Sent {
            // Awaiting acknowledgement; redelivery would double-send.
            return false;
        }
        match op.next_eligible_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    fn emit(&self, event: EmergencyEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{queue_descriptors, EMERGENCY_OPS_BOX};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vital_core::{NoopEscalationSink, NoopTelemetry};
    use vital_storage::{BoxRegistry, StorageEngine};

    /// Consumer scripted to fail N times, then succeed.
    struct FlakyConsumer {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyConsumer {
        fn failing(n: usize) -> Self {
            FlakyConsumer {
                failures_left: AtomicUsize::new(n),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SyncConsumer for FlakyConsumer {
        async fn process(&self, _op: &Operation) -> SyncOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                SyncOutcome::TransientFailure("unreachable".into())
            } else {
                SyncOutcome::Success
            }
        }
    }

    #[derive(Default)]
    struct RecordingSignal {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl EmergencySignal for RecordingSignal {
        fn emergency_success(&self) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
        fn emergency_failure(&self, _op: &Operation) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lane_at(
        dir: &std::path::Path,
        consumer: Arc<dyn SyncConsumer>,
        signal: Arc<dyn EmergencySignal>,
    ) -> EmergencyQueue {
        let registry = Arc::new(BoxRegistry::new());
        for d in queue_descriptors() {
            registry.register(d).unwrap();
        }
        let engine =
            Arc::new(StorageEngine::new(dir, registry, None, Arc::new(NoopTelemetry)).unwrap());
        engine.open_registered().unwrap();
        EmergencyQueue::new(
            engine.typed(EMERGENCY_OPS_BOX).unwrap(),
            QueueConfig::default(),
            consumer,
            Arc::new(NoopEscalationSink),
            signal,
            Arc::new(NoopTelemetry),
        )
    }

    fn emergency_op(id: &str) -> Operation {
        Operation::new(id, "alert", BTreeMap::new(), Priority::Emergency)
    }

    #[test]
    fn test_normal_priority_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lane = lane_at(
            dir.path(),
            Arc::new(FlakyConsumer::failing(0)),
            Arc::new(NoopEmergencySignal),
        );
        let op = Operation::new("op-00000001", "create", BTreeMap::new(), Priority::Normal);
        assert!(matches!(
            lane.enqueue(op),
            Err(QueueError::NotEmergency(_))
        ));
    }

    #[tokio::test]
    async fn test_success_deletes_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let signal = Arc::new(RecordingSignal::default());
        let lane = lane_at(dir.path(), Arc::new(FlakyConsumer::failing(0)), signal.clone());

        lane.enqueue(emergency_op("em-00000001")).unwrap();
        let processed = lane.process_all().await.unwrap();
        assert_eq!(processed, 1);
        assert!(lane.is_empty());
        assert_eq!(signal.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_sets_short_backoff_and_keeps_op() {
        let dir = tempfile::tempdir().unwrap();
        let signal = Arc::new(RecordingSignal::default());
        let lane = lane_at(dir.path(), Arc::new(FlakyConsumer::failing(10)), signal.clone());

        lane.enqueue(emergency_op("em-00000001")).unwrap();
        lane.process_all().await.unwrap();

        assert_eq!(lane.len(), 1);
        assert_eq!(signal.failures.load(Ordering::SeqCst), 1);
        // Backoff gates the next pass until the window passes.
        assert_eq!(lane.eligible_count(Utc::now()), 0);
        assert_eq!(
            lane.eligible_count(Utc::now() + chrono::Duration::seconds(2)),
            1
        );
    }

    #[tokio::test]
    async fn test_escalation_after_five_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let lane = Arc::new(lane_at(
            dir.path(),
            Arc::new(FlakyConsumer::failing(100)),
            Arc::new(NoopEmergencySignal),
        ));
        let mut events = lane.subscribe();

        lane.enqueue(emergency_op("em-00000001")).unwrap();
        // Five failing passes; clear the backoff window between passes.
        for _ in 0..5 {
            clear_backoff(&lane);
            lane.process_all().await.unwrap();
        }

        assert_eq!(lane.escalated_count(), 1, "op escalates at 5 attempts");
        assert_eq!(lane.len(), 1, "escalated op is kept for audit");

        // Escalated ops are skipped on later passes.
        clear_backoff(&lane);
        assert_eq!(lane.process_all().await.unwrap(), 0);

        let mut saw_escalated = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EmergencyEvent::Escalated { .. }) {
                saw_escalated = true;
            }
        }
        assert!(saw_escalated);
    }

    #[tokio::test]
    async fn test_ack_pending_holds_without_redelivery() {
        struct AckOnce;
        #[async_trait]
        impl SyncConsumer for AckOnce {
            async fn process(&self, _op: &Operation) -> SyncOutcome {
                SyncOutcome::AckPending
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let lane = lane_at(dir.path(), Arc::new(AckOnce), Arc::new(NoopEmergencySignal));
        lane.enqueue(emergency_op("em-00000001")).unwrap();

        assert_eq!(lane.process_all().await.unwrap(), 1);
        assert_eq!(lane.len(), 1, "op waits for acknowledgement");
        assert_eq!(lane.process_all().await.unwrap(), 0, "no redelivery");

        assert!(lane.acknowledge("em-00000001").unwrap());
        assert!(lane.is_empty());
    }

    fn clear_backoff(lane: &EmergencyQueue) {
        for key in lane.ops.keys() {
            if let Ok(Some(mut op)) = lane.ops.get(&key) {
                op.next_eligible_at = Some(Utc::now() - chrono::Duration::seconds(1));
                lane.ops.put(&key, &op).unwrap();
            }
        }
    }
}
