//! Normalized Slack events, independent of whether they arrived via polling
//! or Socket Mode.

/// A file attached to a [`SlackMessage`], as reported by the Slack API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackFile {
    /// Original filename, used for extension inference and sanitization.
    pub name: String,
    /// Slack-reported MIME type (e.g. `image/png`).
    pub mimetype: String,
    /// Size in bytes, as reported by Slack.
    pub size_bytes: u64,
    /// Authenticated, private download URL.
    pub url_private: String,
}

/// A single channel message, normalized from either
/// `conversations.history` or a Socket Mode `message` push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackMessage {
    /// Channel the message was posted in.
    pub channel_id: String,
    /// Message ts, used as both ordering key and identifier.
    pub ts: String,
    /// Root ts of the thread this message belongs to, if any.
    pub thread_ts: Option<String>,
    /// Posting user id (or bot id, falling back to `"unknown"`).
    pub user: String,
    /// Raw message text.
    pub text: String,
    /// Slack message subtype, empty for ordinary user messages.
    pub subtype: String,
    /// Files attached to the message, if any.
    pub files: Vec<SlackFile>,
}

/// A single reaction-added event, normalized from a Socket Mode push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackReaction {
    /// Channel the reacted-to message lives in.
    pub channel_id: String,
    /// ts of the message that was reacted to.
    pub message_ts: String,
    /// Reaction name, with wrapping colons stripped.
    pub reaction: String,
    /// User id who added the reaction.
    pub user: String,
}

/// Combined output of one listener receive call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    /// Messages observed this call, ascending by `ts`.
    pub messages: Vec<SlackMessage>,
    /// Reactions observed this call. Always empty in poll mode.
    pub reactions: Vec<SlackReaction>,
}
