//! Stall detector
//!
//! A background watchdog sampling the queue's oldest-op age and the
//! processing-lock record. When the oldest pending operation is older
//! than the stall threshold the queue counts as stalled, and the
//! detector performs bounded recovery: release the lock if stale,
//! rebuild the pending index, poke the dispatcher. Recovery attempts
//! are capped and spaced by a cooldown; clearing the stall resets the
//! budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use vital_core::{Counter, StallConfig, TelemetrySink};

/// Read-only view of the queue the watchdog samples, plus the two
/// recovery levers it may pull.
pub trait QueueProbe: Send + Sync {
    /// Age of the oldest pending operation, if any.
    fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<Duration>;

    /// Release the processing lock if its record is stale.
    fn release_stale_lock(&self, now: DateTime<Utc>) -> bool;

    /// Rebuild the pending index; returns whether it succeeded.
    fn rebuild_index(&self) -> bool;
}

/// The "poke the queue" callback invoked after recovery.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Ask the dispatcher to run a pass.
    async fn recover(&self);
}

/// Watchdog events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallEvent {
    /// The oldest-op age crossed the stall threshold
    StallDetected,
    /// A recovery pass finished
    RecoveryCompleted,
    /// A recovery pass failed
    RecoveryFailed,
    /// The attempt budget is exhausted
    MaxRecoveryReached,
    /// The stall cleared
    Unstalled,
}

/// Background watchdog with bounded auto-recovery.
pub struct StallDetector {
    probe: Arc<dyn QueueProbe>,
    recovery: Arc<dyn RecoveryAction>,
    config: StallConfig,
    telemetry: Arc<dyn TelemetrySink>,
    events: broadcast::Sender<StallEvent>,
    attempts: AtomicU32,
    stalled: AtomicBool,
    budget_exhausted_reported: AtomicBool,
    last_recovery_at: Mutex<Option<DateTime<Utc>>>,
}

impl StallDetector {
    /// Build a detector over a probe and a recovery hook.
    pub fn new(
        probe: Arc<dyn QueueProbe>,
        recovery: Arc<dyn RecoveryAction>,
        config: StallConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        StallDetector {
            probe,
            recovery,
            config,
            telemetry,
            events,
            attempts: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            budget_exhausted_reported: AtomicBool::new(false),
            last_recovery_at: Mutex::new(None),
        }
    }

    /// Subscribe to watchdog events.
    pub fn subscribe(&self) -> broadcast::Receiver<StallEvent> {
        self.events.subscribe()
    }

    /// Recovery attempts since the last unstall.
    pub fn recovery_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether the last check saw a stalled queue.
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Run one watchdog check at `now`.
    pub async fn check_once(&self, now: DateTime<Utc>) {
        let age = self.probe.oldest_pending_age(now);
        let stalled = matches!(age, Some(age) if age > self.config.stall_threshold);

        if !stalled {
            if self.stalled.swap(false, Ordering::SeqCst) {
                tracing::info!("queue unstalled; recovery budget reset");
                self.attempts.store(0, Ordering::SeqCst);
                self.budget_exhausted_reported.store(false, Ordering::SeqCst);
                self.emit(StallEvent::Unstalled);
            }
            return;
        }

        self.stalled.store(true, Ordering::SeqCst);
        tracing::warn!(
            oldest_age_secs = age.map(|a| a.as_secs()).unwrap_or(0),
            "queue stall detected"
        );
        self.emit(StallEvent::StallDetected);

        if self.attempts.load(Ordering::SeqCst) >= self.config.max_recovery_attempts {
            if !self.budget_exhausted_reported.swap(true, Ordering::SeqCst) {
                tracing::error!("stall recovery budget exhausted; manual repair required");
                self.emit(StallEvent::MaxRecoveryReached);
            }
            return;
        }

        if self.in_cooldown(now) {
            tracing::debug!("stall recovery skipped (cooldown)");
            return;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_recovery_at.lock() = Some(now);

        let lock_released = self.probe.release_stale_lock(now);
        let index_ok = self.probe.rebuild_index();
        self.recovery.recover().await;

        if index_ok {
            tracing::info!(lock_released, "stall recovery completed");
            self.telemetry.incr(Counter::StallRecovery);
            self.emit(StallEvent::RecoveryCompleted);
        } else {
            tracing::error!("stall recovery failed (index rebuild)");
            self.emit(StallEvent::RecoveryFailed);
        }
    }

    /// Spawn the periodic watchdog task.
    ///
    /// The caller keeps the handle and aborts it on shutdown.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let detector = self.clone();
        let period = detector.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                detector.check_once(Utc::now()).await;
            }
        })
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_recovery_at.lock();
        match (*last, chrono::Duration::from_std(self.config.recovery_cooldown)) {
            (Some(at), Ok(cooldown)) => now - at < cooldown,
            _ => false,
        }
    }

    fn emit(&self, event: StallEvent) {
        let _ = self.events.send(event);
    }
}
