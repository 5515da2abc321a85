//! Integration tests for the central concurrency guarantee: parallel across
//! groups, serialized within a group.

use conveyor::test_harness::{poll_until, wait_for_status, GateConsumer, TestEnvironment};
use conveyor::{
    TaskRequest, TaskStore, TASK_STATUS_COMPLETED, TASK_STATUS_IN_FLIGHT, TASK_STATUS_SCHEDULED,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn gated_request(n: u32, group: Option<&str>) -> TaskRequest {
    let mut request = TaskRequest::new("buyer-42", "gate", &json!({ "n": n })).unwrap();
    if let Some(group) = group {
        request = request.with_group(group);
    }
    request
}

#[tokio::test]
async fn test_same_group_tasks_never_run_concurrently() {
    let _ = env_logger::try_init();

    let gate = Arc::new(GateConsumer::new(Duration::from_millis(100)));
    let env = TestEnvironment::builder()
        .worker_count(4)
        .consumer("gate", gate.clone())
        .start();

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = env
            .engine
            .submit_request(gated_request(n, Some("event-7")))
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert!(
            wait_for_status(
                env.engine.store(),
                *id,
                TASK_STATUS_COMPLETED,
                Duration::from_secs(5)
            )
            .await,
            "All same-group tasks should eventually complete"
        );
    }

    assert_eq!(gate.completed(), 3);
    assert_eq!(
        gate.max_concurrent(),
        1,
        "Two tasks of the same group must never be in flight at once"
    );

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_different_groups_run_in_parallel() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(300)));
    let env = TestEnvironment::builder()
        .worker_count(4)
        .consumer("gate", gate.clone())
        .start();

    let mut ids = Vec::new();
    for (n, group) in [(0, "event-7"), (1, "event-8"), (2, "event-9")] {
        let id = env
            .engine
            .submit_request(gated_request(n, Some(group)))
            .await
            .unwrap();
        ids.push(id);
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

    assert!(
        gate.max_concurrent() >= 2,
        "Distinct groups should execute in parallel (max concurrent: {})",
        gate.max_concurrent()
    );

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_second_same_group_task_waits_for_the_first() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(400)));
    let env = TestEnvironment::builder()
        .worker_count(4)
        .consumer("gate", gate.clone())
        .start();

    let first = env
        .engine
        .submit_request(gated_request(0, Some("event-7")))
        .await
        .unwrap();
    let second = env
        .engine
        .submit_request(gated_request(1, Some("event-7")))
        .await
        .unwrap();

    // Wait until the first task is observed in flight.
    let observed = poll_until(Duration::from_secs(2), Duration::from_millis(10), || async {
        let record = env.engine.store().get(first).await.unwrap().unwrap();
        (record.status == TASK_STATUS_IN_FLIGHT).then_some(())
    })
    .await;
    assert!(observed.is_some(), "First task should reach IN_FLIGHT");

    // While it holds the group, the second task stays durably SCHEDULED and
    // is never admitted.
    let record = env.engine.store().get(second).await.unwrap().unwrap();
    assert_eq!(record.status, TASK_STATUS_SCHEDULED);
    assert_eq!(env.engine.queue_stats().inflight, 1);

    assert!(
        wait_for_status(
            env.engine.store(),
            second,
            TASK_STATUS_COMPLETED,
            Duration::from_secs(5)
        )
        .await,
        "Second task should run after the group is released"
    );
    assert_eq!(gate.max_concurrent(), 1);

    env.engine.shutdown_with_timeout(5).await.unwrap();
}

#[tokio::test]
async fn test_tasks_without_group_are_unconstrained() {
    let gate = Arc::new(GateConsumer::new(Duration::from_millis(300)));
    let env = TestEnvironment::builder()
        .worker_count(4)
        .consumer("gate", gate.clone())
        .start();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(env.engine.submit_request(gated_request(n, None)).await.unwrap());
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

    assert!(
        gate.max_concurrent() >= 2,
        "Groupless tasks should execute in parallel (max concurrent: {})",
        gate.max_concurrent()
    );

    env.engine.shutdown_with_timeout(5).await.unwrap();
}
