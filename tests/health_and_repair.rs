//! The health snapshot surface and the confirmed repair actions.

mod common;

use common::{op, open_store, ScriptedConsumer};
use vitalstore::{HealthSeverity, Priority, QueueState, RepairAction, RepairError};

#[tokio::test]
async fn fresh_store_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());

    let health = store.health();
    assert_eq!(health.severity, HealthSeverity::Healthy);
    assert_eq!(health.queue_state, QueueState::Idle);
    assert_eq!(health.pending_count, 0);
    assert!(health.policy_violations.is_empty());
}

#[tokio::test]
async fn pending_backlog_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());
    store.enqueue(op("op-1", Priority::Normal)).await.unwrap();
    assert_eq!(store.health().severity, HealthSeverity::Warning);
}

#[tokio::test]
async fn repair_requires_a_matching_fresh_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());

    // Token bound to a different action is refused.
    let token = store.repair().issue_token(RepairAction::CompactBoxes);
    let err = store
        .repair()
        .run(RepairAction::RebuildIndex, &token)
        .unwrap_err();
    assert!(matches!(err, RepairError::ActionMismatch { .. }));

    // Tokens are single-use.
    let token = store.repair().issue_token(RepairAction::RebuildIndex);
    store.repair().run(RepairAction::RebuildIndex, &token).unwrap();
    let err = store
        .repair()
        .run(RepairAction::RebuildIndex, &token)
        .unwrap_err();
    assert!(matches!(err, RepairError::UnknownToken));
}

#[tokio::test]
async fn rebuild_index_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());
    store.enqueue(op("op-1", Priority::Normal)).await.unwrap();
    store.enqueue(op("op-2", Priority::Normal)).await.unwrap();

    for _ in 0..2 {
        let token = store.repair().issue_token(RepairAction::RebuildIndex);
        let outcome = store.repair().run(RepairAction::RebuildIndex, &token).unwrap();
        assert_eq!(outcome.metadata["index_entries"], 2);
    }
    assert_eq!(store.health().pending_count, 2);
}

#[tokio::test]
async fn compact_boxes_preserves_data_and_prunes_journal() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());
    for i in 0..5 {
        store
            .enqueue(op(&format!("op-{}", i), Priority::Normal))
            .await
            .unwrap();
    }
    assert!(store.journal_backlog() > 0);

    let token = store.repair().issue_token(RepairAction::CompactBoxes);
    store.repair().run(RepairAction::CompactBoxes, &token).unwrap();

    assert_eq!(store.journal_backlog(), 0, "committed entries pruned");
    assert_eq!(store.health().pending_count, 5, "compaction loses nothing");

    store.process_pending_batch(10).await.unwrap();
    assert_eq!(store.health().pending_count, 0);
}

#[tokio::test]
async fn verify_encryption_reports_clean_setup() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());
    let token = store.repair().issue_token(RepairAction::VerifyEncryption);
    let outcome = store
        .repair()
        .run(RepairAction::VerifyEncryption, &token)
        .unwrap();
    assert_eq!(outcome.metadata["violations"], serde_json::json!([]));
}
