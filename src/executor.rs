use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::consumer::{ConsumerRegistry, RegistryError};
use crate::queue_manager::QueueManager;
use crate::runner::TaskRunner;
use crate::store::{NewTask, TaskStore};
use crate::task::Task;

/// A fully-specified submission, for callers that need more than the plain
/// `submit` surface: correlation keys, a mutual-exclusion group, or a
/// deferred run time.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub principal: String,
    pub consumer_id: String,
    pub payload_type: String,
    pub payload: JsonValue,
    pub group_id: Option<String>,
    pub record_type: Option<String>,
    pub record_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl TaskRequest {
    /// Serialize `payload` to its transport-neutral form and capture its
    /// declared type name, so it can be decoded generically later.
    pub fn new<P>(principal: &str, consumer_id: &str, payload: &P) -> Result<Self>
    where
        P: Serialize + ?Sized,
    {
        let payload_value = serde_json::to_value(payload)?;

        Ok(Self {
            principal: principal.to_string(),
            consumer_id: consumer_id.to_string(),
            payload_type: std::any::type_name::<P>().to_string(),
            payload: payload_value,
            group_id: None,
            record_type: None,
            record_id: None,
            scheduled_at: None,
        })
    }

    pub fn with_group(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn with_correlation(mut self, record_type: &str, record_id: &str) -> Self {
        self.record_type = Some(record_type.to_string());
        self.record_id = Some(record_id.to_string());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// The submission boundary used by collaborators to enqueue work.
pub struct AsyncExecutor {
    store: Arc<dyn TaskStore>,
    queue: Arc<QueueManager>,
    registry: Arc<ConsumerRegistry>,
    node: Uuid,
}

impl AsyncExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<QueueManager>,
        registry: Arc<ConsumerRegistry>,
        node: Uuid,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            node,
        }
    }

    /// Enqueue a unit of work; returns the durable record id.
    ///
    /// The record is persisted in its own transaction, independent of any
    /// caller state: the task survives even if the caller's surrounding
    /// work later fails, which makes submission at-least-once. Success
    /// means "durably recorded", never anything about the eventual
    /// execution outcome.
    ///
    /// Blocks when the queue is at capacity.
    pub async fn submit<P>(&self, principal: &str, consumer_id: &str, payload: &P) -> Result<i64>
    where
        P: Serialize + ?Sized,
    {
        self.submit_request(TaskRequest::new(principal, consumer_id, payload)?)
            .await
    }

    pub async fn submit_request(&self, request: TaskRequest) -> Result<i64> {
        // Registration bugs surface at submission, not at execution time.
        if !self.registry.contains(&request.consumer_id) {
            return Err(RegistryError::Unknown(request.consumer_id).into());
        }

        let scheduled_at = request.scheduled_at.unwrap_or_else(Utc::now);

        let new_task = NewTask {
            node: self.node,
            consumer_id: request.consumer_id,
            payload_type: request.payload_type,
            payload: request.payload,
            principal: request.principal,
            group_id: request.group_id,
            record_type: request.record_type,
            record_id: request.record_id,
            scheduled_at,
        };

        let id = self.store.insert(&new_task).await?;
        debug!("Submitted task {id} for consumer '{}'", new_task.consumer_id);

        let task = Task {
            id: Some(id),
            principal: new_task.principal,
            consumer_id: new_task.consumer_id,
            payload_type: new_task.payload_type,
            payload: new_task.payload,
            group_id: new_task.group_id,
            scheduled_at,
        };

        self.queue.wait_to_add(task).await;

        Ok(id)
    }
}

/// How long an idle worker sleeps when nothing is due and no wakeup
/// arrives.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Fixed-size pool of workers fed exclusively through the `QueueManager`.
pub struct WorkerPool {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue: Arc<QueueManager>,
        runner: Arc<TaskRunner>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut joins = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&runner);
            let rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, runner, rx).await;
            }));
        }

        Self { joins }
    }

    /// Wait for all workers to exit. Workers finish their in-flight task
    /// before stopping; shutdown does not cancel consumer invocations.
    pub async fn join(self) {
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<QueueManager>,
    runner: Arc<TaskRunner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Worker {worker_id} started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if let Some(task) = queue.next_admissible(Utc::now()) {
            runner.run(task).await;
            continue;
        }

        let wait = match queue.next_due_at() {
            Some(due) => {
                let now = Utc::now();
                if due <= now {
                    // Due work exists but could not be admitted (group busy
                    // or no headroom); a release will wake us.
                    Duration::from_millis(50)
                } else {
                    (due - now).to_std().unwrap_or(IDLE_WAIT).min(IDLE_WAIT)
                }
            }
            None => IDLE_WAIT,
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = queue.work_available() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("Worker {worker_id} stopped");
}
