use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::consumer::{ConsumerRegistry, TaskConsumer, TaskError};
use crate::queue_manager::{EnqueueOutcome, QueueManager};
use crate::retry::TaskRetryManager;
use crate::store::TaskStore;
use crate::task::Task;

enum AttemptOutcome {
    Completed,
    Failed,
    /// The attempt failed with a retryable error and the record was moved
    /// back to `SCHEDULED`; the carried task is due at its new run time.
    Rescheduled(Task),
}

/// Executes one admitted task: durable transition to `IN_FLIGHT`, consumer
/// invocation, outcome classification, durable close of the attempt.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<ConsumerRegistry>,
    queue: Arc<QueueManager>,
    retry: TaskRetryManager,
    node: Uuid,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ConsumerRegistry>,
        queue: Arc<QueueManager>,
        retry: TaskRetryManager,
        node: Uuid,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            retry,
            node,
        }
    }

    /// Run one attempt to a terminal-for-this-attempt status.
    ///
    /// Consumer errors never escape to the worker loop: every failure is
    /// caught, classified, and converted into a durable status transition.
    /// The queue slot is released on every exit path.
    pub async fn run(&self, task: Task) {
        let outcome = self.execute(&task).await;

        self.queue.release(&task);

        match outcome {
            Ok(AttemptOutcome::Rescheduled(retry_task)) => {
                let id = retry_task.id.unwrap_or_default();
                match self.queue.add_scheduled(retry_task) {
                    EnqueueOutcome::Added | EnqueueOutcome::Duplicate => {}
                    EnqueueOutcome::Full => {
                        // The record is durably SCHEDULED; the recovery sweep
                        // will re-admit it once capacity frees up.
                        warn!("Queue full, task {id} left to the recovery sweep");
                    }
                    EnqueueOutcome::Unpersisted => {
                        error!("Rescheduled task {id} lost its record id");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("Task {:?} attempt abandoned: {e:#}", task.id);
            }
        }
    }

    async fn execute(&self, task: &Task) -> Result<AttemptOutcome> {
        let id = task.id.ok_or_else(|| {
            anyhow::anyhow!(
                "task for consumer '{}' has no durable record id; executing an unpersisted \
                 task is a caller bug",
                task.consumer_id
            )
        })?;

        let consumer = self.registry.get(&task.consumer_id)?;

        // One durable write at attempt start. Aborts any stale open attempt
        // and fails loudly if the record is already terminal.
        let attempt = self.store.mark_in_flight(id, self.node).await?;

        info!(
            "Task {id} ({}) attempt started on node {}",
            consumer.task_name(),
            self.node
        );

        match consumer.accept(&task.principal, &task.payload).await {
            Ok(response) => {
                self.store.mark_completed(id, attempt.id, &response).await?;
                info!("Task {id} ({}) completed", consumer.task_name());
                Ok(AttemptOutcome::Completed)
            }
            Err(error) if error.retryable => {
                self.handle_retryable(task, id, attempt.id, consumer.as_ref(), error)
                    .await
            }
            Err(error) => {
                let code = error.retry_code().to_string();
                let summary = consumer.on_error(&code, &error);
                self.store.mark_failed(id, attempt.id, &summary).await?;
                warn!("Task {id} ({}) failed: {summary}", consumer.task_name());
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    async fn handle_retryable(
        &self,
        task: &Task,
        id: i64,
        attempt_id: i64,
        consumer: &dyn TaskConsumer,
        error: TaskError,
    ) -> Result<AttemptOutcome> {
        let code = error.retry_code().to_string();
        let history = self.store.history(id).await?;

        // The ceiling wins over the consumer: a retryable error on the last
        // budgeted attempt is still a terminal failure.
        if consumer.can_retry(&code, &error) && self.retry.can_schedule(&history) {
            let delay = self.retry.interval_for(&history);
            let next_run_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));

            self.store
                .mark_rescheduled(id, attempt_id, &error.to_string(), next_run_at)
                .await?;

            info!(
                "Task {id} ({}) hit retryable error [{code}], rescheduled for {next_run_at}",
                consumer.task_name()
            );

            let mut retry_task = task.clone();
            retry_task.scheduled_at = next_run_at;
            Ok(AttemptOutcome::Rescheduled(retry_task))
        } else {
            let summary = consumer.on_error(&code, &error);
            self.store.mark_failed(id, attempt_id, &summary).await?;
            warn!(
                "Task {id} ({}) failed terminally on retryable error [{code}]: {summary}",
                consumer.task_name()
            );
            Ok(AttemptOutcome::Failed)
        }
    }
}
