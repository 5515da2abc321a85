//! Shared utilities for integration tests: an engine wired to the
//! in-memory store with test-friendly timings, stock consumers, and
//! polling helpers.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RecoveryConfig, Settings};
use crate::consumer::{TaskConsumer, TaskError};
use crate::engine::Engine;
use crate::retry::RetryPolicy;
use crate::store::{MemoryTaskStore, TaskStore};

pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}

/// Wait until the record reaches `status`; returns `false` on timeout.
pub async fn wait_for_status(
    store: &Arc<dyn TaskStore>,
    id: i64,
    status: i16,
    timeout: Duration,
) -> bool {
    poll_until(timeout, Duration::from_millis(20), || async {
        match store.get(id).await {
            Ok(Some(record)) if record.status == status => Some(()),
            _ => None,
        }
    })
    .await
    .is_some()
}

/// An engine on the in-memory store, with timings tightened for tests.
pub struct TestEnvironment {
    pub engine: Engine,
    pub store: Arc<MemoryTaskStore>,
}

impl TestEnvironment {
    pub fn builder() -> TestEnvironmentBuilder {
        TestEnvironmentBuilder::new()
    }
}

pub struct TestEnvironmentBuilder {
    settings: Settings,
    consumers: Vec<(String, Arc<dyn TaskConsumer>)>,
}

impl Default for TestEnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnvironmentBuilder {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.queue.worker_count = 2;
        // Retries fire immediately; tests that need a real delay override
        // the policy.
        settings.retry = RetryPolicy {
            delay_secs: 0.0,
            ..Default::default()
        };
        // Keep the periodic sweep far away so tests drive recovery
        // explicitly via `Engine::recover_now`.
        settings.recovery = RecoveryConfig {
            sweep_interval_secs: 3600,
            stale_after_secs: 60,
            ..Default::default()
        };

        Self {
            settings,
            consumers: Vec::new(),
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.settings.queue.worker_count = count;
        self
    }

    pub fn max_queue_size(mut self, cap: usize) -> Self {
        self.settings.queue.max_queue_size = cap;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry = policy;
        self
    }

    pub fn recovery(mut self, config: RecoveryConfig) -> Self {
        self.settings.recovery = config;
        self
    }

    pub fn consumer(mut self, consumer_id: &str, consumer: Arc<dyn TaskConsumer>) -> Self {
        self.consumers.push((consumer_id.to_string(), consumer));
        self
    }

    pub fn start(self) -> TestEnvironment {
        let store = Arc::new(MemoryTaskStore::new());

        let mut builder = Engine::builder(self.settings);
        for (consumer_id, consumer) in self.consumers {
            builder = builder
                .register(&consumer_id, consumer)
                .expect("duplicate consumer in test environment");
        }

        let engine = builder
            .build_with_store(store.clone())
            .expect("test environment should start");

        TestEnvironment { engine, store }
    }
}

/// Succeeds immediately, echoing its input.
pub struct EchoConsumer;

#[async_trait]
impl TaskConsumer for EchoConsumer {
    fn task_name(&self) -> &str {
        "echo"
    }

    async fn accept(&self, principal: &str, payload: &JsonValue) -> Result<String, TaskError> {
        Ok(format!("echo for {principal}: {payload}"))
    }
}

/// Always fails with the configured error.
pub struct FailingConsumer {
    pub error: TaskError,
    pub retry_allowed: bool,
}

impl FailingConsumer {
    pub fn non_retryable(message: &str) -> Self {
        Self {
            error: TaskError::execution_failed(message),
            retry_allowed: false,
        }
    }

    pub fn retryable(code: &str, message: &str) -> Self {
        Self {
            error: TaskError::retryable(code, message),
            retry_allowed: true,
        }
    }
}

#[async_trait]
impl TaskConsumer for FailingConsumer {
    fn task_name(&self) -> &str {
        "failing"
    }

    async fn accept(&self, _principal: &str, _payload: &JsonValue) -> Result<String, TaskError> {
        Err(self.error.clone())
    }

    fn can_retry(&self, error_code: &str, _error: &TaskError) -> bool {
        self.retry_allowed && Some(error_code) == self.error.code.as_deref()
    }
}

/// Fails with a retryable error a fixed number of times, then succeeds.
pub struct FlakyConsumer {
    code: String,
    failures_before_success: u32,
    attempts: AtomicU32,
}

impl FlakyConsumer {
    pub fn new(code: &str, failures_before_success: u32) -> Self {
        Self {
            code: code.to_string(),
            failures_before_success,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskConsumer for FlakyConsumer {
    fn task_name(&self) -> &str {
        "flaky"
    }

    async fn accept(&self, _principal: &str, _payload: &JsonValue) -> Result<String, TaskError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_success {
            Err(TaskError::retryable(
                &self.code,
                &format!("transient failure on attempt {attempt}"),
            ))
        } else {
            Ok(format!("succeeded on attempt {attempt}"))
        }
    }

    fn can_retry(&self, error_code: &str, _error: &TaskError) -> bool {
        error_code == self.code
    }
}

/// Holds each invocation for a while and records the highest concurrency it
/// ever observed; group-exclusivity tests assert on `max_concurrent`.
pub struct GateConsumer {
    hold: Duration,
    running: AtomicUsize,
    max_seen: AtomicUsize,
    completed: AtomicUsize,
}

impl GateConsumer {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn currently_running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskConsumer for GateConsumer {
    fn task_name(&self) -> &str {
        "gate"
    }

    async fn accept(&self, _principal: &str, _payload: &JsonValue) -> Result<String, TaskError> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now_running, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok("held and released".to_string())
    }
}
