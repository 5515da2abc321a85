use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::store::{NewTask, StaleScope, StoreError, TaskHistory, TaskRecord, TaskStore};
use crate::{
    is_terminal_task_status, HISTORY_STATUS_ABORTED, HISTORY_STATUS_COMPLETED,
    HISTORY_STATUS_FAILED, HISTORY_STATUS_INFLIGHT, HISTORY_STATUS_RESCHEDULED,
    TASK_STATUS_COMPLETED, TASK_STATUS_FAILED, TASK_STATUS_IN_FLIGHT, TASK_STATUS_SCHEDULED,
};

#[derive(Default)]
struct Inner {
    tasks: HashMap<i64, TaskRecord>,
    history: HashMap<i64, Vec<TaskHistory>>,
    next_task_id: i64,
    next_history_id: i64,
}

/// In-memory task store with the same transition semantics as the Postgres
/// store. Test infrastructure only; it forgets everything on drop.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a stored record directly, e.g. to age `updated_at` or forge
    /// another node's ownership when setting up recovery scenarios.
    pub fn with_record_mut<F>(&self, id: i64, f: F) -> bool
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    fn close_attempt(
        &self,
        id: i64,
        history_id: i64,
        history_status: i16,
        task_status: i16,
        response: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let node_text = inner
            .tasks
            .get(&id)
            .and_then(|t| t.node)
            .map(|n| n.to_string());

        let rows = inner
            .history
            .get_mut(&id)
            .ok_or(StoreError::HistoryNotFound(history_id))?;
        let row = rows
            .iter_mut()
            .find(|h| h.id == history_id)
            .ok_or(StoreError::HistoryNotFound(history_id))?;

        row.status = history_status;
        row.executed_on = Some(now);
        row.response = Some(response.to_string());
        row.updated_at = now;
        if let Some(node_text) = &node_text {
            row.updated_by = node_text.clone();
        }

        let record = inner.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.status = task_status;
        record.response = Some(response.to_string());
        if let Some(next_run_at) = next_run_at {
            record.scheduled_at = next_run_at;
        }
        record.updated_at = now;
        if let Some(node_text) = node_text {
            record.updated_by = node_text;
        }

        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &NewTask) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let now = Utc::now();

        let record = TaskRecord {
            id,
            status: TASK_STATUS_SCHEDULED,
            node: Some(task.node),
            consumer_id: task.consumer_id.clone(),
            payload_type: task.payload_type.clone(),
            payload: task.payload.clone(),
            principal: task.principal.clone(),
            group_id: task.group_id.clone(),
            record_type: task.record_type.clone(),
            record_id: task.record_id.clone(),
            response: None,
            scheduled_at: task.scheduled_at,
            last_executed_at: None,
            created_at: now,
            created_by: task.principal.clone(),
            updated_at: now,
            updated_by: task.principal.clone(),
        };

        inner.tasks.insert(id, record);
        inner.history.insert(id, Vec::new());
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn find_by_correlation(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| {
                t.record_type.as_deref() == Some(record_type)
                    && t.record_id.as_deref() == Some(record_id)
            })
            .cloned()
            .collect();
        records.sort_by_key(|t| t.id);
        Ok(records)
    }

    async fn history(&self, task_id: i64) -> Result<Vec<TaskHistory>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows = inner.history.get(&task_id).cloned().unwrap_or_default();
        rows.sort_by_key(|h| h.id);
        Ok(rows)
    }

    async fn mark_in_flight(&self, id: i64, node: Uuid) -> Result<TaskHistory, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let node_text = node.to_string();

        let (status, scheduled_at) = match inner.tasks.get(&id) {
            Some(record) => (record.status, record.scheduled_at),
            None => return Err(StoreError::NotFound(id)),
        };

        if is_terminal_task_status(status) {
            return Err(StoreError::IllegalState { id, status });
        }

        let mut aborted = 0;
        if let Some(rows) = inner.history.get_mut(&id) {
            for row in rows.iter_mut() {
                if row.status == HISTORY_STATUS_INFLIGHT {
                    row.status = HISTORY_STATUS_ABORTED;
                    row.updated_at = now;
                    row.updated_by = node_text.clone();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            log::warn!("Task {id}: aborted {aborted} stale open attempt(s) before new attempt");
        }

        inner.next_history_id += 1;
        let history = TaskHistory {
            id: inner.next_history_id,
            task_id: id,
            status: HISTORY_STATUS_INFLIGHT,
            scheduled_on: scheduled_at,
            executed_on: None,
            response: None,
            created_at: now,
            created_by: node_text.clone(),
            updated_at: now,
            updated_by: node_text.clone(),
        };
        inner.history.entry(id).or_default().push(history.clone());

        let record = inner.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.status = TASK_STATUS_IN_FLIGHT;
        record.node = Some(node);
        record.last_executed_at = Some(now);
        record.updated_at = now;
        record.updated_by = node_text;

        Ok(history)
    }

    async fn mark_completed(
        &self,
        id: i64,
        history_id: i64,
        response: &str,
    ) -> Result<(), StoreError> {
        self.close_attempt(
            id,
            history_id,
            HISTORY_STATUS_COMPLETED,
            TASK_STATUS_COMPLETED,
            response,
            None,
        )
    }

    async fn mark_failed(
        &self,
        id: i64,
        history_id: i64,
        response: &str,
    ) -> Result<(), StoreError> {
        self.close_attempt(
            id,
            history_id,
            HISTORY_STATUS_FAILED,
            TASK_STATUS_FAILED,
            response,
            None,
        )
    }

    async fn mark_rescheduled(
        &self,
        id: i64,
        history_id: i64,
        response: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.close_attempt(
            id,
            history_id,
            HISTORY_STATUS_RESCHEDULED,
            TASK_STATUS_SCHEDULED,
            response,
            Some(next_run_at),
        )
    }

    async fn find_stale(
        &self,
        node: Uuid,
        older_than: DateTime<Utc>,
        scope: StaleScope,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let statuses = crate::store::recoverable_statuses();

        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .filter(|t| t.updated_at < older_than)
            .filter(|t| match scope {
                StaleScope::Orphaned => t.node != Some(node),
                StaleScope::Owned => t.node == Some(node),
            })
            .cloned()
            .collect();
        records.sort_by_key(|t| t.id);
        Ok(records)
    }
}
