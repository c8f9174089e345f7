//! The emergency fast lane end to end: routing, escalation at five
//! attempts, and the safety fallback reacting to repeated failures.

mod common;

use common::{op, open_fast_store, ScriptedConsumer};
use vitalstore::{EmergencyEvent, HealthSeverity, Priority, SafetyMode};

#[tokio::test]
async fn emergency_ops_route_to_the_fast_lane() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_fast_store(dir.path(), consumer.clone());

    store.enqueue(op("em-1", Priority::Emergency)).await.unwrap();
    let health = store.health();
    assert_eq!(health.emergency_count, 1);
    assert_eq!(health.pending_count, 0, "fast lane, not the normal queue");

    store.process_emergency().await.unwrap();
    assert_eq!(store.health().emergency_count, 0);
    assert_eq!(consumer.order(), vec!["em-1"]);
}

#[tokio::test]
async fn escalation_degrades_safety_mode_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_fast_store(dir.path(), consumer.clone());
    let mut events = store.subscribe_emergency_events();

    store.enqueue(op("em-1", Priority::Emergency)).await.unwrap();
    consumer.always_fail("em-1");

    // Five failing passes exhaust the emergency attempt budget.
    for _ in 0..5 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.process_emergency().await.unwrap();
    }

    let health = store.health();
    assert_eq!(health.escalated_count, 1, "escalated op kept for audit");
    assert_eq!(
        health.safety_mode,
        SafetyMode::Emergency,
        "three failures push the safety machine into emergency mode"
    );
    assert_eq!(health.severity, HealthSeverity::Critical);

    let received: Vec<EmergencyEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(received
        .iter()
        .any(|e| matches!(e, EmergencyEvent::Escalated { .. })));

    // A later success (from a retried op) clears the mode; the operator
    // acknowledgement path also works.
    store.acknowledge_safety();
    assert_eq!(store.safety_mode(), SafetyMode::Normal);
}

#[tokio::test]
async fn emergency_success_resets_failure_count() {
    let dir = tempfile::tempdir().unwrap();
    let consumer = ScriptedConsumer::new();
    let store = open_fast_store(dir.path(), consumer.clone());

    store.enqueue(op("em-1", Priority::Emergency)).await.unwrap();
    consumer.script_op(
        "em-1",
        vec![
            vitalstore::SyncOutcome::TransientFailure("1".into()),
            vitalstore::SyncOutcome::TransientFailure("2".into()),
        ],
    );

    for _ in 0..3 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.process_emergency().await.unwrap();
    }
    assert_eq!(store.health().emergency_count, 0, "eventually delivered");
    assert_eq!(store.safety_mode(), SafetyMode::Normal);
}
