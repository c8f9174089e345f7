//! Shared fixtures for the integration tests.

// Each integration binary uses a different slice of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vitalstore::{Operation, Priority, SyncConsumer, SyncOutcome, VitalStore};

/// Consumer with per-op scripted outcomes; unscripted ops succeed.
/// Records delivery order.
#[derive(Default)]
pub struct ScriptedConsumer {
    script: Mutex<HashMap<String, Vec<SyncOutcome>>>,
    seen: Mutex<Vec<String>>,
    pub starts: AtomicUsize,
    pub ends: AtomicUsize,
}

impl ScriptedConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_op(&self, op_id: &str, outcomes: Vec<SyncOutcome>) {
        self.script.lock().insert(op_id.to_string(), outcomes);
    }

    pub fn always_fail(&self, op_id: &str) {
        self.script_op(
            op_id,
            vec![SyncOutcome::TransientFailure("scripted failure".into()); 64],
        );
    }

    pub fn order(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl SyncConsumer for ScriptedConsumer {
    async fn on_queue_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_queue_end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }

    async fn process(&self, op: &Operation) -> SyncOutcome {
        self.seen.lock().push(op.id.clone());
        let mut script = self.script.lock();
        match script.get_mut(&op.id) {
            Some(outcomes) if !outcomes.is_empty() => outcomes.remove(0),
            _ => SyncOutcome::Success,
        }
    }
}

/// Open a store over a temp dir with a scripted consumer.
pub fn open_store(dir: &std::path::Path, consumer: Arc<ScriptedConsumer>) -> VitalStore {
    VitalStore::builder()
        .data_dir(dir)
        .consumer(consumer)
        .open()
        .expect("store should open")
}

/// Configuration with millisecond backoffs, so retry-heavy scenarios
/// run in test time.
pub fn fast_config() -> vitalstore::CoreConfig {
    let mut config = vitalstore::CoreConfig::default();
    config.queue.backoff_base = std::time::Duration::from_millis(1);
    config.queue.emergency_backoff_base = std::time::Duration::from_millis(1);
    config.skip_migration_backups = true;
    config
}

/// Open a store with the fast configuration.
pub fn open_fast_store(dir: &std::path::Path, consumer: Arc<ScriptedConsumer>) -> VitalStore {
    VitalStore::builder()
        .data_dir(dir)
        .consumer(consumer)
        .config(fast_config())
        .open()
        .expect("store should open")
}

/// A normal-priority operation with a valid idempotency key.
pub fn op(id: &str, priority: Priority) -> Operation {
    Operation::new(id, "create", BTreeMap::new(), priority)
        .with_idempotency_key(format!("idem-key-{}", id))
}

/// Same, with `created_at` shifted by `offset_secs`.
pub fn op_at(id: &str, priority: Priority, offset_secs: i64) -> Operation {
    let mut op = op(id, priority);
    op.created_at = op.created_at + chrono::Duration::seconds(offset_secs);
    op
}
