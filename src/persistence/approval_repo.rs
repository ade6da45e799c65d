//! Reaction-driven approval records gating task execution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::clock::now;
use crate::models::{ApprovalRecord, ApprovalStatus};
use crate::{AppError, Result};

use super::db::Database;

#[derive(FromRow)]
struct ApprovalRow {
    task_id: String,
    channel_id: String,
    source_message_ts: String,
    approval_message_ts: String,
    approve_reaction: String,
    reject_reaction: String,
    status: String,
    decided_by: Option<String>,
    decision_reaction: Option<String>,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid timestamp {raw:?}: {err}")))
}

impl ApprovalRow {
    fn into_record(self) -> Result<ApprovalRecord> {
        let status = ApprovalStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("unknown approval status {:?}", self.status)))?;
        Ok(ApprovalRecord {
            task_id: self.task_id,
            channel_id: self.channel_id,
            source_message_ts: self.source_message_ts,
            approval_message_ts: self.approval_message_ts,
            approve_reaction: self.approve_reaction,
            reject_reaction: self.reject_reaction,
            status,
            decided_by: self.decided_by,
            decision_reaction: self.decision_reaction,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "task_id, channel_id, source_message_ts, approval_message_ts, \
     approve_reaction, reject_reaction, status, decided_by, decision_reaction, created_at, \
     updated_at";

/// Repository for the `approval_records` table.
pub struct ApprovalRepo {
    db: Arc<Database>,
}

impl ApprovalRepo {
    /// Wrap a shared database handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new pending approval, or overwrite an existing one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        task_id: &str,
        channel_id: &str,
        source_message_ts: &str,
        approval_message_ts: &str,
        approve_reaction: &str,
        reject_reaction: &str,
        status: ApprovalStatus,
    ) -> Result<()> {
        let timestamp = now().to_rfc3339();
        sqlx::query(
            "INSERT INTO approval_records (task_id, channel_id, source_message_ts, \
             approval_message_ts, approve_reaction, reject_reaction, status, decided_by, \
             decision_reaction, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, ?8)
             ON CONFLICT(task_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                source_message_ts = excluded.source_message_ts,
                approval_message_ts = excluded.approval_message_ts,
                approve_reaction = excluded.approve_reaction,
                reject_reaction = excluded.reject_reaction,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(channel_id)
        .bind(source_message_ts)
        .bind(approval_message_ts)
        .bind(approve_reaction)
        .bind(reject_reaction)
        .bind(status.as_str())
        .bind(timestamp)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fetch the approval record for a task, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn get_by_task_id(&self, task_id: &str) -> Result<Option<ApprovalRecord>> {
        let row: Option<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM approval_records WHERE task_id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&*self.db)
        .await?;
        row.map(ApprovalRow::into_record).transpose()
    }

    /// Find the pending approval whose source or plan message matches `ts`
    /// in `channel_id`. Reactions on either ts resolve the same approval.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or row decoding fails.
    pub async fn get_pending_for_message(
        &self,
        channel_id: &str,
        ts: &str,
    ) -> Result<Option<ApprovalRecord>> {
        let row: Option<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM approval_records
             WHERE channel_id = ?1 AND status = ?2
               AND (source_message_ts = ?3 OR approval_message_ts = ?3)"
        ))
        .bind(channel_id)
        .bind(ApprovalStatus::Pending.as_str())
        .bind(ts)
        .fetch_optional(&*self.db)
        .await?;
        row.map(ApprovalRow::into_record).transpose()
    }

    /// Compare-and-swap an approval from `pending` to `to`, recording who
    /// decided it and which reaction resolved it.
    ///
    /// Returns `true` iff the row was still `pending` and was updated; a
    /// re-reaction after resolution is a no-op (`false`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn resolve(
        &self,
        task_id: &str,
        to: ApprovalStatus,
        decided_by: &str,
        decision_reaction: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE approval_records
             SET status = ?1, decided_by = ?2, decision_reaction = ?3, updated_at = ?4
             WHERE task_id = ?5 AND status = ?6",
        )
        .bind(to.as_str())
        .bind(decided_by)
        .bind(decision_reaction)
        .bind(now().to_rfc3339())
        .bind(task_id)
        .bind(ApprovalStatus::Pending.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    async fn seed(repo: &ApprovalRepo) {
        repo.upsert(
            "task1",
            "C1",
            "100.1",
            "100.2",
            "white_check_mark",
            "x",
            ApprovalStatus::Pending,
        )
        .await
        .expect("upsert");
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = ApprovalRepo::new(db);
        seed(&repo).await;

        let record = repo
            .get_by_task_id("task1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(record.status, ApprovalStatus::Pending);
        assert_eq!(record.approve_reaction, "white_check_mark");
    }

    #[tokio::test]
    async fn get_pending_for_message_matches_either_ts() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = ApprovalRepo::new(db);
        seed(&repo).await;

        assert!(repo
            .get_pending_for_message("C1", "100.1")
            .await
            .expect("lookup")
            .is_some());
        assert!(repo
            .get_pending_for_message("C1", "100.2")
            .await
            .expect("lookup")
            .is_some());
        assert!(repo
            .get_pending_for_message("C1", "100.3")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn resolve_is_cas() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = ApprovalRepo::new(db);
        seed(&repo).await;

        assert!(repo
            .resolve("task1", ApprovalStatus::Approved, "U1", "white_check_mark")
            .await
            .expect("resolve"));
        assert!(!repo
            .resolve("task1", ApprovalStatus::Rejected, "U2", "x")
            .await
            .expect("resolve"));

        let record = repo
            .get_by_task_id("task1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert_eq!(record.decided_by.as_deref(), Some("U1"));
    }
}
