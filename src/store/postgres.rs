use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::db::PgPool;
use crate::store::{NewTask, StaleScope, StoreError, TaskHistory, TaskRecord, TaskStore};
use crate::{
    is_terminal_task_status, HISTORY_STATUS_ABORTED, HISTORY_STATUS_COMPLETED,
    HISTORY_STATUS_FAILED, HISTORY_STATUS_INFLIGHT, HISTORY_STATUS_RESCHEDULED,
    TASK_STATUS_COMPLETED, TASK_STATUS_FAILED, TASK_STATUS_IN_FLIGHT, TASK_STATUS_SCHEDULED,
};

const TASK_COLUMNS: &str = "id, status, node, consumer_id, payload_type, payload, principal, \
     group_id, record_type, record_id, response, scheduled_at, last_executed_at, \
     created_at, created_by, updated_at, updated_by";

const HISTORY_COLUMNS: &str =
    "id, task_id, status, scheduled_on, executed_on, response, created_at, created_by, \
     updated_at, updated_by";

/// PostgreSQL-backed task store. Every method commits its own small
/// transaction.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &Row) -> TaskRecord {
        TaskRecord {
            id: row.get("id"),
            status: row.get("status"),
            node: row.get("node"),
            consumer_id: row.get("consumer_id"),
            payload_type: row.get("payload_type"),
            payload: row.get("payload"),
            principal: row.get("principal"),
            group_id: row.get("group_id"),
            record_type: row.get("record_type"),
            record_id: row.get("record_id"),
            response: row.get("response"),
            scheduled_at: row.get("scheduled_at"),
            last_executed_at: row.get("last_executed_at"),
            created_at: row.get("created_at"),
            created_by: row.get("created_by"),
            updated_at: row.get("updated_at"),
            updated_by: row.get("updated_by"),
        }
    }

    fn history_from_row(row: &Row) -> TaskHistory {
        TaskHistory {
            id: row.get("id"),
            task_id: row.get("task_id"),
            status: row.get("status"),
            scheduled_on: row.get("scheduled_on"),
            executed_on: row.get("executed_on"),
            response: row.get("response"),
            created_at: row.get("created_at"),
            created_by: row.get("created_by"),
            updated_at: row.get("updated_at"),
            updated_by: row.get("updated_by"),
        }
    }

    /// Close the current attempt and set the record's next status, in one
    /// transaction.
    async fn close_attempt(
        &self,
        id: i64,
        history_id: i64,
        history_status: i16,
        task_status: i16,
        response: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut client = self.pool.get().await.map_err(db_err)?;
        let transaction = client.transaction().await.map_err(db_err)?;

        let updated = transaction
            .execute(
                "UPDATE task_history h \
                 SET status = $2, executed_on = now(), response = $3, updated_at = now(), \
                     updated_by = COALESCE(t.node::text, h.updated_by) \
                 FROM tasks t \
                 WHERE h.id = $1 AND t.id = h.task_id",
                &[&history_id, &history_status, &response],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return Err(StoreError::HistoryNotFound(history_id));
        }

        let updated = transaction
            .execute(
                "UPDATE tasks \
                 SET status = $2, response = $3, \
                     scheduled_at = COALESCE($4::timestamptz, scheduled_at), \
                     updated_at = now(), updated_by = COALESCE(node::text, updated_by) \
                 WHERE id = $1",
                &[&id, &task_status, &response, &next_run_at],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }

        transaction.commit().await.map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Database(e.into())
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: &NewTask) -> Result<i64, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let row = client
            .query_one(
                "INSERT INTO tasks (status, node, consumer_id, payload_type, payload, \
                     principal, group_id, record_type, record_id, scheduled_at, \
                     created_by, updated_by) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) \
                 RETURNING id",
                &[
                    &TASK_STATUS_SCHEDULED,
                    &task.node,
                    &task.consumer_id,
                    &task.payload_type,
                    &task.payload,
                    &task.principal,
                    &task.group_id,
                    &task.record_type,
                    &task.record_id,
                    &task.scheduled_at,
                    &task.principal,
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(row.get("id"))
    }

    async fn get(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let statement = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = client
            .query_opt(statement.as_str(), &[&id])
            .await
            .map_err(db_err)?;

        Ok(row.as_ref().map(Self::record_from_row))
    }

    async fn find_by_correlation(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let statement = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE record_type = $1 AND record_id = $2 ORDER BY id"
        );
        let rows = client
            .query(statement.as_str(), &[&record_type, &record_id])
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(Self::record_from_row).collect())
    }

    async fn history(&self, task_id: i64) -> Result<Vec<TaskHistory>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let statement =
            format!("SELECT {HISTORY_COLUMNS} FROM task_history WHERE task_id = $1 ORDER BY id");
        let rows = client
            .query(statement.as_str(), &[&task_id])
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(Self::history_from_row).collect())
    }

    async fn mark_in_flight(&self, id: i64, node: Uuid) -> Result<TaskHistory, StoreError> {
        let mut client = self.pool.get().await.map_err(db_err)?;
        let transaction = client.transaction().await.map_err(db_err)?;

        let row = transaction
            .query_opt(
                "SELECT status, scheduled_at FROM tasks WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound(id))?;

        let status: i16 = row.get("status");
        if is_terminal_task_status(status) {
            // Dropping the transaction rolls back; nothing has been written.
            return Err(StoreError::IllegalState { id, status });
        }

        let scheduled_at: DateTime<Utc> = row.get("scheduled_at");
        let node_text = node.to_string();

        let aborted = transaction
            .execute(
                "UPDATE task_history \
                 SET status = $2, updated_at = now(), updated_by = $3 \
                 WHERE task_id = $1 AND status = $4",
                &[&id, &HISTORY_STATUS_ABORTED, &node_text, &HISTORY_STATUS_INFLIGHT],
            )
            .await
            .map_err(db_err)?;

        if aborted > 0 {
            log::warn!("Task {id}: aborted {aborted} stale open attempt(s) before new attempt");
        }

        let statement = format!(
            "INSERT INTO task_history (task_id, status, scheduled_on, created_by, updated_by) \
             VALUES ($1, $2, $3, $4, $4) \
             RETURNING {HISTORY_COLUMNS}"
        );
        let history_row = transaction
            .query_one(
                statement.as_str(),
                &[&id, &HISTORY_STATUS_INFLIGHT, &scheduled_at, &node_text],
            )
            .await
            .map_err(db_err)?;

        transaction
            .execute(
                "UPDATE tasks \
                 SET status = $2, node = $3, last_executed_at = now(), updated_at = now(), \
                     updated_by = $4 \
                 WHERE id = $1",
                &[&id, &TASK_STATUS_IN_FLIGHT, &node, &node_text],
            )
            .await
            .map_err(db_err)?;

        transaction.commit().await.map_err(db_err)?;

        Ok(Self::history_from_row(&history_row))
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
        .await
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
        .await
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
        .await
    }

    async fn find_stale(
        &self,
        node: Uuid,
        older_than: DateTime<Utc>,
        scope: StaleScope,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let statuses = crate::store::recoverable_statuses();
        let node_filter = match scope {
            StaleScope::Orphaned => "(node IS NULL OR node <> $3)",
            StaleScope::Owned => "node = $3",
        };

        let statement = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = ANY($1) AND updated_at < $2 AND {node_filter} \
             ORDER BY id"
        );
        let rows = client
            .query(statement.as_str(), &[&statuses, &older_than, &node])
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(Self::record_from_row).collect())
    }
}
