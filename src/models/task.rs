//! Durable task record and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued, not yet claimed by a worker.
    Pending,
    /// Gated behind a reaction-driven approval decision.
    WaitingApproval,
    /// Claimed by a worker and currently executing.
    Running,
    /// Finished with a zero-equivalent result.
    Succeeded,
    /// Finished with a failure result.
    Failed,
    /// Rejected during approval, never executed.
    Canceled,
    /// Found `running` at startup; rewritten by the crash-recovery sweep.
    AbortedOnRestart,
}

impl TaskStatus {
    /// Lowercase string form, matching the persisted column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::WaitingApproval => "waiting_approval",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::AbortedOnRestart => "aborted_on_restart",
        }
    }

    /// Parse the persisted column value back into a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "waiting_approval" => Some(Self::WaitingApproval),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "aborted_on_restart" => Some(Self::AbortedOnRestart),
            _ => None,
        }
    }

    /// Whether this status is a terminal state a task never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::AbortedOnRestart
        )
    }
}

/// The structured body of a task, independent of its lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskPayload {
    /// Channel the triggering command message was posted in.
    pub channel_id: String,
    /// ts of the triggering command message.
    pub message_ts: String,
    /// Root ts of the thread the command belongs to (equals `message_ts`
    /// for non-threaded messages).
    pub thread_ts: String,
    /// Slack user id who posted the command.
    pub trigger_user: String,
    /// Raw, untouched text of the triggering message.
    pub trigger_text: String,
    /// Command text after trigger/lock-prefix stripping.
    pub command_text: String,
    /// Serialization key; defaults to `"global"`.
    pub lock_key: String,
    /// Absolute paths of any materialized image attachments.
    pub image_paths: Vec<String>,
}

/// A durable task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Deterministic 16-hex-digit id derived from channel, ts, and raw text.
    pub task_id: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Structured task body.
    pub payload: TaskPayload,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}
