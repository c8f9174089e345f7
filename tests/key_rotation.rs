//! Key rotation through the facade: data survives, and rotation is
//! idempotent across repeated runs.

mod common;

use common::{op, open_store, ScriptedConsumer};
use vitalstore::Priority;

#[tokio::test]
async fn rotation_preserves_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());

    store.enqueue(op("op-1", Priority::Normal)).await.unwrap();
    store.rotate_encryption_key().unwrap();

    // Same session still reads and processes the re-encrypted op.
    assert_eq!(store.health().pending_count, 1);
    store.process_pending_batch(10).await.unwrap();
    assert_eq!(consumer.order(), vec!["op-1"]);
}

#[tokio::test]
async fn rotation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), ScriptedConsumer::new());
        store.enqueue(op("op-1", Priority::Normal)).await.unwrap();
        store.rotate_encryption_key().unwrap();
    }

    // The rotated key is the active key for the next session.
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());
    assert_eq!(store.health().pending_count, 1);
    store.process_pending_batch(10).await.unwrap();
    assert_eq!(consumer.order(), vec!["op-1"]);
}

#[tokio::test]
async fn repeated_rotation_converges() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), ScriptedConsumer::new());
    store.enqueue(op("op-1", Priority::Normal)).await.unwrap();

    store.rotate_encryption_key().unwrap();
    store.rotate_encryption_key().unwrap();
    assert_eq!(store.health().pending_count, 1);
}
