//! Per-thread agent session identity and rolling thread context.

use std::sync::Arc;

use crate::clock::now;
use crate::models::AgentSession;
use crate::Result;

use super::db::Database;

/// Thread context is retained as the last-N characters of the rolling log.
const THREAD_CONTEXT_MAX_CHARS: usize = 12_000;

fn truncate_to_last_chars(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_owned();
    }
    text.chars().skip(char_count - max_chars).collect()
}

/// Repository for the `agent_sessions` and `thread_context` tables.
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Wrap a shared database handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch the resumable session id for `(channel_id, thread_ts, agent)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_session(
        &self,
        channel_id: &str,
        thread_ts: &str,
        agent: &str,
    ) -> Result<Option<AgentSession>> {
        let session_id: Option<String> = sqlx::query_scalar(
            "SELECT session_id FROM agent_sessions
             WHERE channel_id = ?1 AND thread_ts = ?2 AND agent = ?3",
        )
        .bind(channel_id)
        .bind(thread_ts)
        .bind(agent)
        .fetch_optional(&*self.db)
        .await?;

        Ok(session_id.map(|session_id| AgentSession {
            channel_id: channel_id.to_owned(),
            thread_ts: thread_ts.to_owned(),
            agent: agent.to_owned(),
            session_id,
        }))
    }

    /// Persist a session id for `(channel_id, thread_ts, agent)`, creating
    /// or overwriting the row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert_session(
        &self,
        channel_id: &str,
        thread_ts: &str,
        agent: &str,
        session_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_sessions (channel_id, thread_ts, agent, session_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_id, thread_ts, agent) DO UPDATE SET
                session_id = excluded.session_id,
                updated_at = excluded.updated_at",
        )
        .bind(channel_id)
        .bind(thread_ts)
        .bind(agent)
        .bind(session_id)
        .bind(now().to_rfc3339())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fetch the rolling thread context for a thread, if any has been
    /// recorded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_thread_context(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Option<String>> {
        let text: Option<String> = sqlx::query_scalar(
            "SELECT text FROM thread_context WHERE channel_id = ?1 AND thread_ts = ?2",
        )
        .bind(channel_id)
        .bind(thread_ts)
        .fetch_optional(&*self.db)
        .await?;
        Ok(text)
    }

    /// Append a triple to a thread's rolling context and truncate to the
    /// last 12,000 characters.
    ///
    /// This is a read-modify-write against a single row; concurrent writers
    /// on the same thread can interleave and clobber each other. Lock keys
    /// are derived from command text (`lock:<name>`, `path:<path>`, or
    /// `global`), not from the thread, so two messages in the same thread
    /// with different lock keys can run concurrently under
    /// `WORKER_PROCESSES > 1` and race this update. Not serialized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read or write fails.
    pub async fn append_thread_context(
        &self,
        channel_id: &str,
        thread_ts: &str,
        agent: &str,
        user_prompt: &str,
        assistant_response: &str,
    ) -> Result<()> {
        let existing = self.get_thread_context(channel_id, thread_ts).await?;
        let triple = format!("agent={agent}\nuser={user_prompt}\nassistant={assistant_response}");
        let combined = match existing {
            Some(prior) if !prior.is_empty() => format!("{prior}\n\n{triple}"),
            _ => triple,
        };
        let truncated = truncate_to_last_chars(&combined, THREAD_CONTEXT_MAX_CHARS);

        sqlx::query(
            "INSERT INTO thread_context (channel_id, thread_ts, text, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel_id, thread_ts) DO UPDATE SET
                text = excluded.text,
                updated_at = excluded.updated_at",
        )
        .bind(channel_id)
        .bind(thread_ts)
        .bind(truncated)
        .bind(now().to_rfc3339())
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn session_upsert_then_get_round_trips() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = SessionRepo::new(db);

        assert!(repo
            .get_session("C1", "1.0", "codex")
            .await
            .expect("get")
            .is_none());

        repo.upsert_session("C1", "1.0", "codex", "sess-a")
            .await
            .expect("upsert");
        let session = repo
            .get_session("C1", "1.0", "codex")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(session.session_id, "sess-a");

        repo.upsert_session("C1", "1.0", "codex", "sess-b")
            .await
            .expect("upsert");
        let session = repo
            .get_session("C1", "1.0", "codex")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(session.session_id, "sess-b");
    }

    #[tokio::test]
    async fn thread_context_accumulates_and_truncates() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = SessionRepo::new(db);

        repo.append_thread_context("C1", "1.0", "codex", "first", "ok")
            .await
            .expect("append");
        repo.append_thread_context("C1", "1.0", "kimi", "second", "done")
            .await
            .expect("append");

        let context = repo
            .get_thread_context("C1", "1.0")
            .await
            .expect("get")
            .expect("exists");
        assert!(context.contains("agent=codex"));
        assert!(context.contains("agent=kimi"));
    }

    #[tokio::test]
    async fn thread_context_caps_at_twelve_thousand_chars() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let repo = SessionRepo::new(db);

        let huge = "x".repeat(THREAD_CONTEXT_MAX_CHARS);
        repo.append_thread_context("C1", "1.0", "codex", &huge, "ok")
            .await
            .expect("append");

        let context = repo
            .get_thread_context("C1", "1.0")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(context.chars().count(), THREAD_CONTEXT_MAX_CHARS);
    }
}
