//! Crash consistency: an uncommitted transaction intent left by a crash
//! replays at startup, so the pending store and the index never
//! disagree; restarts preserve enqueued work.

mod common;

use common::{op, open_store, ScriptedConsumer};
use std::sync::Arc;
use vital_core::NoopTelemetry;
use vital_journal::{JournalOp, TransactionJournal, JOURNAL_BOX};
use vital_storage::{BoxDescriptor, BoxRegistry, EncryptionPolicy, StorageEngine};
use vitalstore::Priority;

#[tokio::test]
async fn restart_preserves_pending_ops() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), ScriptedConsumer::new());
        for id in ["op-1", "op-2", "op-3"] {
            store.enqueue(op(id, Priority::Normal)).await.unwrap();
        }
    }

    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());
    assert_eq!(store.health().pending_count, 3);

    store.process_pending_batch(10).await.unwrap();
    assert_eq!(consumer.order(), vec!["op-1", "op-2", "op-3"]);
    assert_eq!(store.health().pending_count, 0);
}

#[tokio::test]
async fn uncommitted_intent_replays_into_both_stores() {
    let dir = tempfile::tempdir().unwrap();
    {
        // Establish the data dir (keys, boxes, meta).
        let store = open_store(dir.path(), ScriptedConsumer::new());
        store.enqueue(op("op-seed", Priority::Normal)).await.unwrap();
    }

    // Simulate a crash between the journal append and the box writes: a
    // raw engine writes the intention but never applies it. The op
    // record is plaintext JSON; the box codec reads mixed records.
    {
        let registry = Arc::new(BoxRegistry::new());
        registry
            .register(BoxDescriptor::new(
                JOURNAL_BOX,
                EncryptionPolicy::Forbidden,
                2,
                1,
            ))
            .unwrap();
        registry
            .register(BoxDescriptor::new(
                "pending_ops",
                EncryptionPolicy::Optional,
                10,
                1,
            ))
            .unwrap();
        registry
            .register(BoxDescriptor::new(
                "pending_index",
                EncryptionPolicy::Optional,
                11,
                1,
            ))
            .unwrap();
        let engine = Arc::new(
            StorageEngine::new(dir.path(), registry, None, Arc::new(NoopTelemetry)).unwrap(),
        );
        engine.open_registered().unwrap();
        let journal = TransactionJournal::new(engine.clone(), Arc::new(NoopTelemetry)).unwrap();

        let crashed = op("op-crashed", Priority::Normal);
        let value = serde_json::to_vec(&crashed).unwrap();
        // Index sequence 9999… is far above the seed op's slot.
        journal
            .append_intent_unapplied(vec![
                JournalOp::Write {
                    box_name: "pending_ops".to_string(),
                    key: "op-crashed".to_string(),
                    value,
                },
                JournalOp::Write {
                    box_name: "pending_index".to_string(),
                    key: format!("{:020}", 999_999u64),
                    value: serde_json::to_vec("op-crashed").unwrap(),
                },
            ])
            .unwrap();
    }

    // Startup replays the intention; both stores see the op.
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());
    assert_eq!(store.health().pending_count, 2, "replayed op is visible");

    store.process_pending_batch(10).await.unwrap();
    assert_eq!(store.health().pending_count, 0);
    assert!(consumer.order().contains(&"op-crashed".to_string()));
}
