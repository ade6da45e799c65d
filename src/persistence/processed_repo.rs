//! Idempotency set of already-observed Slack messages.

use std::sync::Arc;

use crate::clock::now;
use crate::Result;

use super::db::Database;

/// Tracks which `(channel_id, message_ts)` pairs have already been
/// observed, so a message is never decided twice.
pub struct ProcessedRepo {
    db: Arc<Database>,
}

impl ProcessedRepo {
    /// Wrap a shared database handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a message as processed.
    ///
    /// Returns `true` iff this call newly inserted the row — the caller
    /// should decide the message only when this returns `true`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn mark_processed(&self, channel_id: &str, message_ts: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_messages (channel_id, message_ts, processed_at) VALUES (?1, ?2, ?3)",
        )
        .bind(channel_id)
        .bind(message_ts)
        .bind(now().to_rfc3339())
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = ProcessedRepo::new(db);

        assert!(repo.mark_processed("C1", "1.0").await.expect("mark"));
        assert!(!repo.mark_processed("C1", "1.0").await.expect("mark"));
        assert!(repo.mark_processed("C1", "2.0").await.expect("mark"));
    }
}
