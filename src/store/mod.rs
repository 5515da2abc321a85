pub mod postgres;

#[cfg(any(test, feature = "test-harness"))]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::task::Task;
use crate::{is_terminal_task_status, TASK_STATUS_IN_FLIGHT, TASK_STATUS_SCHEDULED};

pub use postgres::PgTaskStore;

#[cfg(any(test, feature = "test-harness"))]
pub use memory::MemoryTaskStore;

/// One row of the `tasks` table: the durable truth about a submitted task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: i64,
    pub status: i16,
    /// Worker process that currently owns / last owned this task.
    pub node: Option<Uuid>,
    pub consumer_id: String,
    pub payload_type: String,
    pub payload: JsonValue,
    pub principal: String,
    pub group_id: Option<String>,
    /// Business correlation keys, opaque to the queue.
    pub record_type: Option<String>,
    pub record_id: Option<String>,
    /// Last human-readable outcome text.
    pub response: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl TaskRecord {
    pub fn is_terminal(&self) -> bool {
        is_terminal_task_status(self.status)
    }

    /// Rebuild the in-memory descriptor for this record, e.g. for
    /// re-admission by the recovery sweep.
    pub fn to_task(&self) -> Task {
        Task {
            id: Some(self.id),
            principal: self.principal.clone(),
            consumer_id: self.consumer_id.clone(),
            payload_type: self.payload_type.clone(),
            payload: self.payload.clone(),
            group_id: self.group_id.clone(),
            scheduled_at: self.scheduled_at,
        }
    }
}

/// One row of the `task_history` table: the outcome of a single attempt.
#[derive(Debug, Clone)]
pub struct TaskHistory {
    pub id: i64,
    pub task_id: i64,
    pub status: i16,
    pub scheduled_on: DateTime<Utc>,
    pub executed_on: Option<DateTime<Utc>>,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Fields needed to persist a new task in `SCHEDULED` state.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub node: Uuid,
    pub consumer_id: String,
    pub payload_type: String,
    pub payload: JsonValue,
    pub principal: String,
    pub group_id: Option<String>,
    pub record_type: Option<String>,
    pub record_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Which stale records a recovery sweep is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleScope {
    /// Records owned by some other (presumably dead) node.
    Orphaned,
    /// Records owned by this node itself.
    Owned,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(i64),

    #[error("task history row {0} not found")]
    HistoryNotFound(i64),

    #[error("task {id} is in terminal status {status} and cannot be re-run")]
    IllegalState { id: i64, status: i16 },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Statuses eligible for recovery: everything non-terminal that a crashed
/// process could have left behind.
pub fn recoverable_statuses() -> Vec<i16> {
    vec![TASK_STATUS_SCHEDULED, TASK_STATUS_IN_FLIGHT]
}

/// Durable store for task records and their per-attempt history.
///
/// Every mutation is one small, independently-committed transaction; no
/// transaction ever spans a consumer invocation, so a crash mid-execution
/// leaves the record `IN_FLIGHT` for the recovery sweep to find.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task in `SCHEDULED` state. Own transaction, independent
    /// of any caller state.
    async fn insert(&self, task: &NewTask) -> Result<i64, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// Lookup by the collaborator-supplied correlation keys.
    async fn find_by_correlation(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Ordered attempt history for a task. Explicit call; nothing is
    /// lazily loaded behind the record.
    async fn history(&self, task_id: i64) -> Result<Vec<TaskHistory>, StoreError>;

    /// Transition the record to `IN_FLIGHT` under `node` and open a new
    /// `INFLIGHT` history row for this attempt.
    ///
    /// Any previously open history row is forced to `ABORTED` first, so at
    /// most one attempt is ever open. Calling this on a record in terminal
    /// status is an illegal-state error and writes nothing.
    async fn mark_in_flight(&self, id: i64, node: Uuid) -> Result<TaskHistory, StoreError>;

    /// Close the attempt as succeeded and the record as `COMPLETED`.
    async fn mark_completed(
        &self,
        id: i64,
        history_id: i64,
        response: &str,
    ) -> Result<(), StoreError>;

    /// Close the attempt and the record as `FAILED` (terminal unless the
    /// retry path later re-marks the record).
    async fn mark_failed(&self, id: i64, history_id: i64, response: &str)
        -> Result<(), StoreError>;

    /// Close the attempt as `RESCHEDULED` and move the record back to
    /// `SCHEDULED`, eligible again at `next_run_at`.
    async fn mark_rescheduled(
        &self,
        id: i64,
        history_id: i64,
        response: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Records in `{SCHEDULED, IN_FLIGHT}` whose `updated_at` is older than
    /// `older_than`, filtered by ownership relative to `node`.
    async fn find_stale(
        &self,
        node: Uuid,
        older_than: DateTime<Utc>,
        scope: StaleScope,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// `get` with a short bounded poll, covering read-replica lag between
    /// a task's creation and its first read.
    async fn get_with_retry(&self, id: i64) -> Result<TaskRecord, StoreError> {
        const ATTEMPTS: u32 = 5;
        const BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

        for attempt in 0..ATTEMPTS {
            if let Some(record) = self.get(id).await? {
                return Ok(record);
            }
            if attempt + 1 < ATTEMPTS {
                log::debug!("Task {id} not yet visible, polling again");
                tokio::time::sleep(BACKOFF).await;
            }
        }

        Err(StoreError::NotFound(id))
    }
}
