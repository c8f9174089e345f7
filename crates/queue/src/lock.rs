//! Processing lock
//!
//! A singleton process-level lock stored in the meta store. It prevents
//! two dispatcher runs from interleaving writes. A holder that stops
//! renewing (crash, kill) leaves a record behind; once the record's age
//! reaches the stale threshold the next acquirer reclaims it, marking
//! the takeover for telemetry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use vital_core::{Counter, TelemetrySink};
use vital_storage::{meta_keys, MetaStore, ProcessingLockRecord};

/// Singleton dispatcher lock.
pub struct ProcessingLock {
    meta: MetaStore,
    stale_threshold: Duration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ProcessingLock {
    /// Wrap the meta store.
    pub fn new(
        meta: MetaStore,
        stale_threshold: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        ProcessingLock {
            meta,
            stale_threshold,
            telemetry,
        }
    }

    /// Try to take the lock for `holder`.
    ///
    /// Succeeds when the lock is free, already held by `holder`, or held
    /// by a record whose age has reached the stale threshold. A stale
    /// takeover records `stale_recovered` and bumps the counter.
    pub fn try_acquire(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match self.meta.processing_lock() {
            None => {
                self.write_record(holder, now, false);
                true
            }
            Some(record) if record.holder == holder => {
                self.write_record(holder, now, record.stale_recovered);
                true
            }
            Some(record) if self.is_stale(&record, now) => {
                tracing::warn!(
                    previous_holder = %record.holder,
                    held_since = %record.started_at,
                    "reclaiming stale processing lock"
                );
                self.telemetry.incr(Counter::StaleLockRecovered);
                self.write_record(holder, now, true);
                true
            }
            Some(_) => false,
        }
    }

    /// Release the lock iff `holder` owns it.
    pub fn release(&self, holder: &str) -> bool {
        match self.meta.processing_lock() {
            Some(record) if record.holder == holder => {
                self.meta.delete(meta_keys::PROCESSING_LOCK)
            }
            _ => false,
        }
    }

    /// Release the lock regardless of holder if its record is stale.
    ///
    /// The stall detector's recovery path.
    pub fn release_if_stale(&self, now: DateTime<Utc>) -> bool {
        match self.meta.processing_lock() {
            Some(record) if self.is_stale(&record, now) => {
                tracing::warn!(holder = %record.holder, "clearing stale processing lock");
                self.telemetry.incr(Counter::StaleLockRecovered);
                self.meta.delete(meta_keys::PROCESSING_LOCK)
            }
            _ => false,
        }
    }

    /// Current lock record, if held.
    pub fn record(&self) -> Option<ProcessingLockRecord> {
        self.meta.processing_lock()
    }

    /// Whether a record has reached the stale threshold.
    pub fn is_stale(&self, record: &ProcessingLockRecord, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.stale_threshold) {
            Ok(threshold) => now - record.started_at >= threshold,
            Err(_) => false,
        }
    }

    fn write_record(&self, holder: &str, now: DateTime<Utc>, stale_recovered: bool) {
        self.meta.put(
            meta_keys::PROCESSING_LOCK,
            &ProcessingLockRecord {
                holder: holder.to_string(),
                started_at: now,
                stale_recovered,
            },
        );
    }
}
