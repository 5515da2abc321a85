//! Integration tests for engine lifecycle: start-up, capacity
//! backpressure, and graceful shutdown.

use conveyor::test_harness::{
    poll_until, wait_for_status, EchoConsumer, GateConsumer, TestEnvironment,
};
use conveyor::{TaskStore, TASK_STATUS_COMPLETED, TASK_STATUS_SCHEDULED};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_engine_starts_and_shuts_down_cleanly() {
    let _ = env_logger::try_init();

    let env = TestEnvironment::builder()
        .consumer("echo", Arc::new(EchoConsumer))
        .start();

    let id = env.engine.submit("buyer-42", "echo", &json!({})).await.unwrap();
    assert!(
        wait_for_status(
            env.engine.store(),
            id,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(2)
        )
        .await
    );

    env.engine.shutdown_with_timeout(5).await.unwrap();

    // The queue drained before shutdown.
    let stats = env.engine.queue_stats();
    assert_eq!(stats.inflight, 0);
}

#[tokio::test]
async fn test_full_queue_blocks_the_submitter() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(400)));
    let env = TestEnvironment::builder()
        .worker_count(1)
        .max_queue_size(1)
        .consumer("gate", gate.clone())
        .start();

    // Fills the single capacity slot.
    let first = env.engine.submit("buyer-42", "gate", &json!({"n": 0})).await.unwrap();

    let engine = env.engine;
    let env_store = env.store;
    let engine = Arc::new(engine);

    let blocked = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit("buyer-42", "gate", &json!({"n": 1})).await })
    };

    // The second submission must block rather than be dropped or rejected.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    // Once the first task finishes and frees capacity, the submitter
    // unblocks and its task eventually runs too.
    let second = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("submitter should unblock once capacity frees up")
        .unwrap()
        .unwrap();

    let store: Arc<dyn conveyor::TaskStore> = env_store;
    assert!(wait_for_status(&store, first, TASK_STATUS_COMPLETED, Duration::from_secs(5)).await);
    assert!(wait_for_status(&store, second, TASK_STATUS_COMPLETED, Duration::from_secs(5)).await);

    engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_leaves_unstarted_tasks_durable() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(300)));
    let env = TestEnvironment::builder()
        .worker_count(1)
        .consumer("gate", gate.clone())
        .start();

    // Both tasks share a group, so the second cannot start while the first
    // holds it.
    let first = env
        .engine
        .submit_request(
            conveyor::TaskRequest::new("buyer-42", "gate", &json!({"n": 0}))
                .unwrap()
                .with_group("event-7"),
        )
        .await
        .unwrap();
    let second = env
        .engine
        .submit_request(
            conveyor::TaskRequest::new("buyer-42", "gate", &json!({"n": 1}))
                .unwrap()
                .with_group("event-7"),
        )
        .await
        .unwrap();

    // Wait for the first to be picked up, then shut down while the second
    // is still waiting on the group.
    let picked_up = poll_until(Duration::from_secs(2), Duration::from_millis(10), || async {
        (gate.currently_running() > 0).then_some(())
    })
    .await;
    assert!(picked_up.is_some());

    env.engine.shutdown_with_timeout(5).await.unwrap();

    // The in-flight task finished; the waiting one is still durably
    // SCHEDULED for the next run to resume.
    let first_record = env.engine.store().get(first).await.unwrap().unwrap();
    assert_eq!(first_record.status, TASK_STATUS_COMPLETED);

    let second_record = env.engine.store().get(second).await.unwrap().unwrap();
    assert_eq!(second_record.status, TASK_STATUS_SCHEDULED);
}

#[tokio::test]
async fn test_queue_capacity_is_never_exceeded() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(50)));
    let env = TestEnvironment::builder()
        .worker_count(2)
        .max_queue_size(4)
        .consumer("gate", gate.clone())
        .start();

    let mut ids = Vec::new();
    for n in 0..8 {
        let id = env.engine.submit("buyer-42", "gate", &json!({ "n": n })).await.unwrap();
        ids.push(id);

        let stats = env.engine.queue_stats();
        assert!(
            stats.scheduled + stats.inflight <= 4,
            "capacity bound violated: {} scheduled + {} inflight",
            stats.scheduled,
            stats.inflight
        );
    }

    for id in &ids {
        assert!(
            wait_for_status(
                env.engine.store(),
                *id,
                TASK_STATUS_COMPLETED,
                Duration::from_secs(5)
            )
            .await
        );
    }

    env.engine.shutdown_with_timeout(5).await.unwrap();
}
