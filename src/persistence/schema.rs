//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every server startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates every table idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS processed_messages (
    channel_id      TEXT NOT NULL,
    message_ts      TEXT NOT NULL,
    processed_at    TEXT NOT NULL,
    PRIMARY KEY (channel_id, message_ts)
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id         TEXT PRIMARY KEY NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','waiting_approval','running','succeeded','failed','canceled','aborted_on_restart')),
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_locks (
    lock_key        TEXT PRIMARY KEY NOT NULL,
    task_id         TEXT NOT NULL,
    acquired_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_records (
    task_id             TEXT PRIMARY KEY NOT NULL,
    channel_id          TEXT NOT NULL,
    source_message_ts   TEXT NOT NULL,
    approval_message_ts TEXT NOT NULL,
    approve_reaction    TEXT NOT NULL,
    reject_reaction     TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('pending','approved','rejected')),
    decided_by          TEXT,
    decision_reaction   TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_sessions (
    channel_id      TEXT NOT NULL,
    thread_ts       TEXT NOT NULL,
    agent           TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (channel_id, thread_ts, agent)
);

CREATE TABLE IF NOT EXISTS thread_context (
    channel_id      TEXT NOT NULL,
    thread_ts       TEXT NOT NULL,
    text            TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (channel_id, thread_ts)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    key             TEXT PRIMARY KEY NOT NULL,
    value           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_approval_channel_status ON approval_records(channel_id, status);
CREATE INDEX IF NOT EXISTS idx_execution_locks_task ON execution_locks(task_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
