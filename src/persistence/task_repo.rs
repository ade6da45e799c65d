//! Durable task records and the execution locks that serialize them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::clock::now;
use crate::models::{Task, TaskPayload, TaskStatus};
use crate::{AppError, Result};

use super::db::Database;

#[derive(FromRow)]
struct TaskRow {
    task_id: String,
    status: String,
    payload: String,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid timestamp {raw:?}: {err}")))
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("unknown task status {:?}", self.status)))?;
        let payload: TaskPayload = serde_json::from_str(&self.payload)
            .map_err(|err| AppError::Db(format!("invalid task payload: {err}")))?;
        Ok(Task {
            task_id: self.task_id,
            status,
            payload,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Repository for the `tasks` and `execution_locks` tables.
pub struct TaskRepo {
    db: Arc<Database>,
}

impl TaskRepo {
    /// Wrap a shared database handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task, or update an existing one's status and payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails or the payload cannot be
    /// serialized.
    pub async fn upsert_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        payload: &TaskPayload,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|err| AppError::Db(format!("failed to serialize payload: {err}")))?;
        let timestamp = now().to_rfc3339();

        sqlx::query(
            "INSERT INTO tasks (task_id, status, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(payload_json)
        .bind(timestamp)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    /// Unconditionally set a task's status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3")
            .bind(status.as_str())
            .bind(now().to_rfc3339())
            .bind(task_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Compare-and-swap a task's status from `from` to `to`.
    ///
    /// Returns `true` iff the row existed with status `from` and was
    /// updated; this is the at-most-once execution primitive — callers must
    /// never assume they hold a task without a successful CAS.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn transition_task_status(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(now().to_rfc3339())
        .bind(task_id)
        .bind(from.as_str())
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT task_id, status, payload, created_at, updated_at FROM tasks WHERE task_id = ?1")
                .bind(task_id)
                .fetch_optional(&*self.db)
                .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Whether a task with this id already exists, regardless of status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn task_exists(&self, task_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_one(&*self.db)
            .await?;
        Ok(count > 0)
    }

    /// Crash-recovery sweep: rewrite every `running` task to
    /// `aborted_on_restart`. Returns the number of tasks rewritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn mark_running_tasks_aborted(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE status = ?3")
            .bind(TaskStatus::AbortedOnRestart.as_str())
            .bind(now().to_rfc3339())
            .bind(TaskStatus::Running.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// All tasks currently in `pending`, ordered by creation time. Used to
    /// optionally rehydrate the in-memory queue on startup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn list_pending(&self) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT task_id, status, payload, created_at, updated_at FROM tasks WHERE status = ?1 ORDER BY created_at ASC",
        )
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(&*self.db)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Grant a lock to a task if the key is unheld.
    ///
    /// Insert-if-absent is the CAS primitive here: a crashed owner's task_id
    /// never transitions again, so a stale lock is only ever released
    /// through the maintenance routine in [`TaskRepo::release_lock`], not
    /// reclaimed automatically.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn acquire_lock(&self, lock_key: &str, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO execution_locks (lock_key, task_id, acquired_at) VALUES (?1, ?2, ?3)",
        )
        .bind(lock_key)
        .bind(task_id)
        .bind(now().to_rfc3339())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release a lock, but only if it is still held by `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn release_lock(&self, lock_key: &str, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM execution_locks WHERE lock_key = ?1 AND task_id = ?2")
            .bind(lock_key)
            .bind(task_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}
