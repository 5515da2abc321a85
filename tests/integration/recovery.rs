//! Integration tests for crash recovery: the orphan sweep, the
//! self-recovery sweep, and the one-shot start-up pass.

use conveyor::config::{RecoveryConfig, Settings};
use conveyor::store::{MemoryTaskStore, NewTask, TaskStore};
use conveyor::test_harness::{wait_for_status, EchoConsumer, TestEnvironment};
use conveyor::{
    Engine, HISTORY_STATUS_ABORTED, HISTORY_STATUS_COMPLETED, TASK_STATUS_COMPLETED,
    TASK_STATUS_SCHEDULED,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn orphan_new_task(node: Uuid) -> NewTask {
    NewTask {
        node,
        consumer_id: "echo".to_string(),
        payload_type: "Payload".to_string(),
        payload: json!({"n": 1}),
        principal: "buyer-42".to_string(),
        group_id: None,
        record_type: None,
        record_id: None,
        scheduled_at: chrono::Utc::now(),
    }
}

fn age(store: &MemoryTaskStore, id: i64, minutes: i64) {
    store.with_record_mut(id, |r| {
        r.updated_at = chrono::Utc::now() - chrono::Duration::minutes(minutes)
    });
}

/// The crashed-worker scenario: node A marks a record in flight and dies;
/// node B's orphan sweep re-admits it, the stale open attempt is aborted,
/// and a fresh attempt completes under node B.
#[tokio::test]
async fn test_orphaned_in_flight_record_is_recovered_and_executed() {
    let _ = env_logger::try_init();

    let env = TestEnvironment::builder()
        .consumer("echo", Arc::new(EchoConsumer))
        .start();

    let dead_node = Uuid::new_v4();
    let id = env.store.insert(&orphan_new_task(dead_node)).await.unwrap();
    env.store.mark_in_flight(id, dead_node).await.unwrap();
    age(&env.store, id, 30);

    let stats = env.engine.recover_now().await.unwrap();
    assert_eq!(stats.orphaned_recovered, 1);

    assert!(
        wait_for_status(
            env.engine.store(),
            id,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(5)
        )
        .await,
        "Recovered orphan should execute to completion"
    );

    let history = env.engine.store().history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, HISTORY_STATUS_ABORTED);
    assert_eq!(history[1].status, HISTORY_STATUS_COMPLETED);

    // Ownership moved to this engine's node.
    let record = env.engine.store().get(id).await.unwrap().unwrap();
    assert_eq!(record.node, Some(env.engine.settings().queue.node));

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_self_recovery_readmits_own_stale_work() {
    let env = TestEnvironment::builder()
        .consumer("echo", Arc::new(EchoConsumer))
        .start();

    let own_node = env.engine.settings().queue.node;
    let id = env.store.insert(&orphan_new_task(own_node)).await.unwrap();
    age(&env.store, id, 30);

    let stats = env.engine.recover_now().await.unwrap();
    assert_eq!(stats.own_recovered, 1);
    assert_eq!(stats.orphaned_recovered, 0);

    assert!(
        wait_for_status(
            env.engine.store(),
            id,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(5)
        )
        .await
    );

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_disabled_sweeps_leave_stale_records_alone() {
    let env = TestEnvironment::builder()
        .recovery(RecoveryConfig {
            recover_orphaned: false,
            recover_own: false,
            sweep_interval_secs: 3600,
            stale_after_secs: 60,
        })
        .consumer("echo", Arc::new(EchoConsumer))
        .start();

    let id = env
        .store
        .insert(&orphan_new_task(Uuid::new_v4()))
        .await
        .unwrap();
    age(&env.store, id, 30);

    let stats = env.engine.recover_now().await.unwrap();
    assert_eq!(stats.total(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = env.engine.store().get(id).await.unwrap().unwrap();
    assert_eq!(record.status, TASK_STATUS_SCHEDULED);

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_repeated_sweeps_admit_once() {
    let env = TestEnvironment::builder()
        .worker_count(1)
        .consumer("echo", Arc::new(EchoConsumer))
        .start();

    let id = env
        .store
        .insert(&orphan_new_task(Uuid::new_v4()))
        .await
        .unwrap();
    age(&env.store, id, 30);

    // Two quick passes: the second finds the record already queued.
    let first = env.engine.recover_now().await.unwrap();
    let second = env.engine.recover_now().await.unwrap();
    assert_eq!(first.total() + second.total(), 1);

    assert!(
        wait_for_status(
            env.engine.store(),
            id,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(5)
        )
        .await
    );

    // Executed exactly once.
    let history = env.engine.store().history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HISTORY_STATUS_COMPLETED);

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

/// Work left over by a previous run is resumed by the start-up pass, before
/// the periodic sweep's first tick.
#[tokio::test]
async fn test_startup_pass_resumes_previous_runs_work() {
    let store = Arc::new(MemoryTaskStore::new());

    let previous_node = Uuid::new_v4();
    let id = store.insert(&orphan_new_task(previous_node)).await.unwrap();
    store.mark_in_flight(id, previous_node).await.unwrap();
    store.with_record_mut(id, |r| {
        r.updated_at = chrono::Utc::now() - chrono::Duration::minutes(30)
    });

    let mut settings = Settings::default();
    settings.queue.worker_count = 2;
    settings.recovery = RecoveryConfig {
        sweep_interval_secs: 3600,
        stale_after_secs: 60,
        ..Default::default()
    };

    let engine = Engine::builder(settings)
        .register("echo", Arc::new(EchoConsumer))
        .unwrap()
        .build_with_store(store.clone())
        .unwrap();

    // No explicit recovery call: the start-up pass alone must re-admit it.
    assert!(
        wait_for_status(
            engine.store(),
            id,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(5)
        )
        .await,
        "Start-up recovery should resume the abandoned task"
    );

    engine.shutdown_with_timeout(5).await.unwrap();
}
