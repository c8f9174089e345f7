//! Priority is strict between levels, FIFO within a level, and the
//! emergency lane always drains before the normal queue.

mod common;

use common::{op_at, open_store, ScriptedConsumer};
use vitalstore::Priority;

#[tokio::test]
async fn emergency_then_high_then_normal() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());

    store.enqueue(op_at("a", Priority::Normal, 0)).await.unwrap();
    store.enqueue(op_at("b", Priority::Emergency, 1)).await.unwrap();
    store.enqueue(op_at("c", Priority::High, 2)).await.unwrap();

    // The emergency op routed to the fast lane; drain it first, then
    // the normal queue, which is the order the dispatcher enforces.
    store.process_emergency().await.unwrap();
    store.process_pending_batch(3).await.unwrap();

    assert_eq!(consumer.order(), vec!["b", "c", "a"]);
    let health = store.health();
    assert_eq!(health.pending_count, 0);
    assert_eq!(health.emergency_count, 0);
}

#[tokio::test]
async fn fifo_within_one_level() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());

    for (i, id) in ["first", "second", "third"].into_iter().enumerate() {
        store
            .enqueue(op_at(id, Priority::Normal, i as i64))
            .await
            .unwrap();
    }
    store.process_pending_batch(10).await.unwrap();
    assert_eq!(consumer.order(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn low_priority_waits_for_high() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_store(dir.path(), consumer.clone());

    store.enqueue(op_at("bg", Priority::Low, 0)).await.unwrap();
    store.enqueue(op_at("hi", Priority::High, 5)).await.unwrap();

    store.process_pending_batch(10).await.unwrap();
    assert_eq!(
        consumer.order(),
        vec!["hi", "bg"],
        "a later high op still precedes an earlier low op"
    );
}
