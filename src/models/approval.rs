//! Reaction-driven approval record gating a task's execution.

use chrono::{DateTime, Utc};

/// Lifecycle status of an [`ApprovalRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    /// Awaiting an approve/reject reaction.
    Pending,
    /// Resolved via the configured approve reaction.
    Approved,
    /// Resolved via the configured reject reaction.
    Rejected,
}

impl ApprovalStatus {
    /// Lowercase string form, matching the persisted column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the persisted column value back into a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One pending-or-resolved approval gate for a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRecord {
    /// The task this approval gates; primary key.
    pub task_id: String,
    /// Channel the source command message lives in.
    pub channel_id: String,
    /// ts of the original command message.
    pub source_message_ts: String,
    /// ts of the bot-posted plan message.
    pub approval_message_ts: String,
    /// Reaction name that approves this task.
    pub approve_reaction: String,
    /// Reaction name that rejects this task.
    pub reject_reaction: String,
    /// Current resolution status.
    pub status: ApprovalStatus,
    /// Slack user id who resolved the approval, once resolved.
    pub decided_by: Option<String>,
    /// Reaction name that resolved the approval, once resolved.
    pub decision_reaction: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}
