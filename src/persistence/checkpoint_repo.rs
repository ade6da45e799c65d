//! Arbitrary key/value checkpoints, used for `last_ts:<channel_id>` in poll
//! mode.

use std::sync::Arc;

use crate::Result;

use super::db::Database;

/// Repository for the `checkpoints` table.
pub struct CheckpointRepo {
    db: Arc<Database>,
}

impl CheckpointRepo {
    /// Wrap a shared database handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a checkpoint value, if set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM checkpoints WHERE key = ?1")
                .bind(key)
                .fetch_optional(&*self.db)
                .await?;
        Ok(value)
    }

    /// Set a checkpoint value, overwriting any prior value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

/// Checkpoint key for the last observed poll-mode `ts` in a channel.
#[must_use]
pub fn last_ts_key(channel_id: &str) -> String {
    format!("last_ts:{channel_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = CheckpointRepo::new(db);

        assert_eq!(repo.get("last_ts:C1").await.expect("get"), None);
        repo.set("last_ts:C1", "1.5").await.expect("set");
        assert_eq!(
            repo.get("last_ts:C1").await.expect("get"),
            Some("1.5".to_owned())
        );
        repo.set("last_ts:C1", "2.5").await.expect("set");
        assert_eq!(
            repo.get("last_ts:C1").await.expect("get"),
            Some("2.5".to_owned())
        );
    }
}
