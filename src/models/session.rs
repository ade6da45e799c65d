//! Agent session identity, keyed by Slack thread and agent name.

/// Identifies one of the three supported coding-agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// The `kimi` CLI.
    Kimi,
    /// The `codex` CLI.
    Codex,
    /// The `claude` CLI.
    Claude,
}

impl AgentKind {
    /// Lowercase name used as both the persisted column value and the CLI
    /// binary name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kimi => "kimi",
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }
}

/// A resumable agent conversation bound to one Slack thread.
///
/// One row per `(channel_id, thread_ts, agent)` triple; the `session_id` is
/// an opaque token the underlying CLI uses to resume its own conversation
/// state across separate invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    /// Channel the owning thread lives in.
    pub channel_id: String,
    /// Root message ts of the thread.
    pub thread_ts: String,
    /// Which agent CLI this session belongs to.
    pub agent: String,
    /// Opaque session identifier understood by the agent CLI.
    pub session_id: String,
}
