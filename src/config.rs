//! Frozen application configuration, assembled once at startup.
//!
//! Values are read from the process environment, with an optional TOML file
//! supplying defaults underneath it (environment variables always win). The
//! parsing and validation rules mirror the reference implementation's
//! configuration module exactly: numeric/bool coercion, mode allow-lists,
//! and the cross-field rules in [`Config::validate`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{AppError, Result};

/// How the command channel is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Periodic `conversations.history` polling.
    Poll,
    /// Socket Mode WebSocket stream.
    Socket,
}

/// How a command message is recognized among ordinary channel chatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Text must start with a configured literal prefix.
    Prefix,
    /// Text must start with a mention of the configured bot user id.
    Mention,
}

/// Whether commands execute immediately or wait for human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Commands pass through the approval manager.
    Approve,
    /// Commands run without gating; forces `ApprovalMode::None`.
    Run,
}

/// Approval gating strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// No gating; every decided task is enqueued immediately.
    None,
    /// Reaction-driven approval; requires `ListenerMode::Socket`.
    Reaction,
}

const DEFAULT_SHELL_ALLOWLIST: &[&str] = &[
    "echo", "printf", "pwd", "ls", "cat", "head", "tail", "wc", "grep", "rg", "find", "sed",
    "awk", "cut", "sort", "uniq", "date", "whoami", "uname", "env", "true", "false", "cd",
    "python", "python3", "pip", "pip3", "pytest", "node", "npm", "yarn", "pnpm", "go", "cargo",
    "make", "git", "bash", "sh", "zsh",
];

const DEFAULT_AGENT_RESPONSE_INSTRUCTION: &str = "Format the final answer for Slack Markdown. Start with a one-line summary, use short bullet lists, and put commands/code in fenced code blocks.";

/// Frozen, validated application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Bot user OAuth token (`xoxb-...`).
    pub slack_bot_token: String,
    /// App-level token (`xapp-...`); required when `listener_mode` is socket.
    pub slack_app_token: Option<String>,
    /// Channel watched for command messages.
    pub command_channel_id: String,
    /// Channel results are posted to.
    pub report_channel_id: String,
    /// Ingestion strategy.
    pub listener_mode: ListenerMode,
    /// Poll-mode cadence, in seconds.
    pub poll_interval_seconds: f64,
    /// Maximum messages fetched per `conversations.history` page.
    pub poll_batch_size: u32,
    /// Socket-mode blocking-receive timeout, in seconds.
    pub socket_read_timeout_seconds: f64,
    /// How a command is recognized.
    pub trigger_mode: TriggerMode,
    /// Literal prefix when `trigger_mode` is prefix.
    pub trigger_prefix: String,
    /// Bot user id, required when `trigger_mode` is mention.
    pub bot_user_id: Option<String>,
    /// Path to the embedded state database file.
    pub state_db_path: PathBuf,
    /// Wall-clock timeout applied to every subprocess invocation.
    pub exec_timeout_seconds: u64,
    /// When true, the executor performs no subprocess invocations.
    pub dry_run: bool,
    /// Approval gating mode, before the `run` override.
    pub run_mode: RunMode,
    /// Effective approval mode (post `run_mode` override).
    pub approval_mode: ApprovalMode,
    /// Reaction name that approves a pending task.
    pub approve_reaction: String,
    /// Reaction name that rejects a pending task.
    pub reject_reaction: String,
    /// Lower-cased, order-preserving, deduplicated shell command allowlist.
    pub shell_allowlist: Vec<String>,
    /// Number of worker tasks draining the queue; 1 means inline execution.
    pub worker_processes: usize,
    /// Kimi CLI permission mode (`yolo`, `auto`, `yes`, or conservative).
    pub kimi_permission_mode: String,
    /// Codex CLI permission mode.
    pub codex_permission_mode: String,
    /// Codex CLI sandbox mode.
    pub codex_sandbox_mode: String,
    /// Claude CLI permission mode.
    pub claude_permission_mode: String,
    /// Instruction appended to every agent prompt; empty disables it.
    pub agent_response_instruction: String,
    /// Trim cap applied to the reported command text.
    pub report_input_max_chars: usize,
    /// Trim cap applied to the reported summary.
    pub report_summary_max_chars: usize,
    /// Trim cap applied to the reported details.
    pub report_details_max_chars: usize,
}

struct Sources {
    env: HashMap<String, String>,
    file: HashMap<String, String>,
}

impl Sources {
    fn has(&self, key: &str) -> bool {
        self.env.contains_key(key) || self.file.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .or_else(|| self.file.get(key))
            .map(String::as_str)
    }
}

fn required(sources: &Sources, key: &str) -> Result<String> {
    let value = sources.get(key).unwrap_or("").trim();
    if value.is_empty() {
        return Err(AppError::Config(format!("{key} is required")));
    }
    Ok(value.to_owned())
}

fn required_with_alias(sources: &Sources, key: &str, alias: &str) -> Result<String> {
    let primary = sources.get(key).unwrap_or("").trim();
    if !primary.is_empty() {
        return Ok(primary.to_owned());
    }
    let fallback = sources.get(alias).unwrap_or("").trim();
    if !fallback.is_empty() {
        return Ok(fallback.to_owned());
    }
    Err(AppError::Config(format!("{key} is required")))
}

fn optional(sources: &Sources, key: &str) -> Option<String> {
    sources
        .get(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn with_default(sources: &Sources, key: &str, default: &str) -> String {
    optional(sources, key).unwrap_or_else(|| default.to_owned())
}

fn parse_positive_f64(sources: &Sources, key: &str, default: f64) -> Result<f64> {
    match optional(sources, key) {
        None => Ok(default),
        Some(raw) => {
            let parsed: f64 = raw
                .parse()
                .map_err(|_| AppError::Config(format!("{key} must be a number, got {raw:?}")))?;
            if parsed <= 0.0 {
                return Err(AppError::Config(format!("{key} must be greater than zero")));
            }
            Ok(parsed)
        }
    }
}

fn parse_positive_u64(sources: &Sources, key: &str, default: u64) -> Result<u64> {
    match optional(sources, key) {
        None => Ok(default),
        Some(raw) => {
            let parsed: u64 = raw
                .parse()
                .map_err(|_| AppError::Config(format!("{key} must be an integer, got {raw:?}")))?;
            if parsed == 0 {
                return Err(AppError::Config(format!("{key} must be greater than zero")));
            }
            Ok(parsed)
        }
    }
}

fn parse_bool(sources: &Sources, key: &str, default: bool) -> Result<bool> {
    match optional(sources, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            other => Err(AppError::Config(format!(
                "{key} must be a boolean-like value, got {other:?}"
            ))),
        },
    }
}

fn validate_mode(sources: &Sources, key: &str, default: &str, allowed: &[&str]) -> Result<String> {
    let value = with_default(sources, key, default);
    if !allowed.contains(&value.as_str()) {
        return Err(AppError::Config(format!(
            "{key} must be one of {allowed:?}, got {value:?}"
        )));
    }
    Ok(value)
}

fn parse_command_list(sources: &Sources, key: &str, default: &[&str]) -> Vec<String> {
    let Some(raw) = optional(sources, key) else {
        return default.iter().map(|s| (*s).to_owned()).collect();
    };
    let mut seen = std::collections::HashSet::new();
    let mut ordered = Vec::new();
    for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let normalized = token.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.clone()) {
            ordered.push(normalized);
        }
    }
    if ordered.is_empty() {
        return default.iter().map(|s| (*s).to_owned()).collect();
    }
    ordered
}

fn strip_reaction_wrapping(raw: &str) -> String {
    raw.trim().trim_matches(':').trim().to_owned()
}

impl Config {
    /// Load configuration from the process environment, optionally layering
    /// an underlying TOML file whose top-level keys match the environment
    /// variable names in `spec.md` §6 (environment always wins).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a required value is missing, a value
    /// fails to parse, or a cross-field validation rule is violated.
    pub fn load(file_path: Option<&Path>) -> Result<Self> {
        let file = match file_path {
            Some(path) => read_toml_table(path)?,
            None => HashMap::new(),
        };
        let env = std::env::vars().collect();
        let sources = Sources { env, file };
        Self::from_sources(&sources)
    }

    fn from_sources(sources: &Sources) -> Result<Self> {
        let slack_bot_token =
            required_with_alias(sources, "SLACK_BOT_TOKEN", "SLACK_MCP_XOXB_TOKEN")?;

        let listener_mode = match validate_mode(
            sources,
            "LISTENER_MODE",
            "socket",
            &["poll", "socket"],
        )?
        .as_str()
        {
            "poll" => ListenerMode::Poll,
            _ => ListenerMode::Socket,
        };

        let slack_app_token = if matches!(listener_mode, ListenerMode::Socket) {
            Some(required_with_alias(
                sources,
                "SLACK_APP_TOKEN",
                "SLACK_MCP_XAPP_TOKEN",
            )?)
        } else {
            optional(sources, "SLACK_APP_TOKEN")
        };

        let socket_read_timeout_seconds =
            parse_positive_f64(sources, "SOCKET_READ_TIMEOUT_SECONDS", 1.0)?;

        let command_channel_id = required(sources, "COMMAND_CHANNEL_ID")?;
        let report_channel_id = required(sources, "REPORT_CHANNEL_ID")?;

        let poll_interval_seconds = parse_positive_f64(sources, "POLL_INTERVAL", 3.0)?;
        let poll_batch_size =
            u32::try_from(parse_positive_u64(sources, "POLL_BATCH_SIZE", 100)?)
                .unwrap_or(u32::MAX);
        if poll_batch_size > 200 {
            return Err(AppError::Config(
                "POLL_BATCH_SIZE must be <= 200 (Slack API max)".into(),
            ));
        }

        let trigger_mode = match validate_mode(
            sources,
            "TRIGGER_MODE",
            "prefix",
            &["prefix", "mention"],
        )?
        .as_str()
        {
            "mention" => TriggerMode::Mention,
            _ => TriggerMode::Prefix,
        };
        let trigger_prefix = with_default(sources, "TRIGGER_PREFIX", "!do");
        if trigger_prefix.is_empty() {
            return Err(AppError::Config("TRIGGER_PREFIX must not be empty".into()));
        }
        let bot_user_id = if matches!(trigger_mode, TriggerMode::Mention) {
            Some(required(sources, "BOT_USER_ID")?)
        } else {
            optional(sources, "BOT_USER_ID")
        };

        let state_db_path =
            PathBuf::from(with_default(sources, "STATE_DB_PATH", "./state.db"));
        let exec_timeout_seconds = parse_positive_u64(sources, "EXEC_TIMEOUT_SECONDS", 120)?;
        let dry_run = parse_bool(sources, "DRY_RUN", true)?;
        let worker_processes =
            usize::try_from(parse_positive_u64(sources, "WORKER_PROCESSES", 1)?)
                .unwrap_or(usize::MAX);

        let run_mode = match validate_mode(sources, "RUN_MODE", "approve", &["approve", "run"])?
            .as_str()
        {
            "run" => RunMode::Run,
            _ => RunMode::Approve,
        };

        let requested_approval_mode =
            validate_mode(sources, "APPROVAL_MODE", "reaction", &["none", "reaction"])?;
        let approval_mode = if matches!(run_mode, RunMode::Run) {
            ApprovalMode::None
        } else if requested_approval_mode == "reaction" {
            ApprovalMode::Reaction
        } else {
            ApprovalMode::None
        };
        if matches!(approval_mode, ApprovalMode::Reaction)
            && !matches!(listener_mode, ListenerMode::Socket)
        {
            return Err(AppError::Config(
                "APPROVAL_MODE=reaction requires LISTENER_MODE=socket".into(),
            ));
        }

        let approve_reaction = strip_reaction_wrapping(&with_default(
            sources,
            "APPROVE_REACTION",
            "white_check_mark",
        ));
        let reject_reaction =
            strip_reaction_wrapping(&with_default(sources, "REJECT_REACTION", "x"));
        if approve_reaction.is_empty() || reject_reaction.is_empty() {
            return Err(AppError::Config(
                "APPROVE_REACTION and REJECT_REACTION must not be empty".into(),
            ));
        }
        if approve_reaction == reject_reaction {
            return Err(AppError::Config(
                "APPROVE_REACTION and REJECT_REACTION must differ".into(),
            ));
        }

        let shell_allowlist =
            parse_command_list(sources, "SHELL_ALLOWLIST", DEFAULT_SHELL_ALLOWLIST);

        let agent_response_instruction = if sources.has("AGENT_RESPONSE_INSTRUCTION") {
            sources
                .get("AGENT_RESPONSE_INSTRUCTION")
                .unwrap_or_default()
                .to_owned()
        } else {
            DEFAULT_AGENT_RESPONSE_INSTRUCTION.to_owned()
        };

        let report_input_max_chars =
            usize::try_from(parse_positive_u64(sources, "REPORT_INPUT_MAX_CHARS", 500)?)
                .unwrap_or(usize::MAX);
        let report_summary_max_chars =
            usize::try_from(parse_positive_u64(sources, "REPORT_SUMMARY_MAX_CHARS", 1200)?)
                .unwrap_or(usize::MAX);
        let report_details_max_chars =
            usize::try_from(parse_positive_u64(sources, "REPORT_DETAILS_MAX_CHARS", 4000)?)
                .unwrap_or(usize::MAX);

        Ok(Self {
            slack_bot_token,
            slack_app_token,
            command_channel_id,
            report_channel_id,
            listener_mode,
            poll_interval_seconds,
            poll_batch_size,
            socket_read_timeout_seconds,
            trigger_mode,
            trigger_prefix,
            bot_user_id,
            state_db_path,
            exec_timeout_seconds,
            dry_run,
            run_mode,
            approval_mode,
            approve_reaction,
            reject_reaction,
            shell_allowlist,
            worker_processes,
            kimi_permission_mode: with_default(sources, "KIMI_PERMISSION_MODE", "conservative"),
            codex_permission_mode: with_default(
                sources,
                "CODEX_PERMISSION_MODE",
                "conservative",
            ),
            codex_sandbox_mode: with_default(sources, "CODEX_SANDBOX_MODE", "workspace-write"),
            claude_permission_mode: with_default(
                sources,
                "CLAUDE_PERMISSION_MODE",
                "conservative",
            ),
            agent_response_instruction,
            report_input_max_chars,
            report_summary_max_chars,
            report_details_max_chars,
        })
    }
}

fn read_toml_table(path: &Path) -> Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("failed to read config file: {err}")))?;
    let value: toml::Value = toml::from_str(&raw)?;
    let table = value
        .as_table()
        .ok_or_else(|| AppError::Config("config file must be a TOML table".into()))?;
    let mut map = HashMap::new();
    for (key, value) in table {
        let rendered = match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        map.insert(key.to_ascii_uppercase(), rendered);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(pairs: &[(&str, &str)]) -> Sources {
        let env = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Sources {
            env,
            file: HashMap::new(),
        }
    }

    #[test]
    fn rejects_missing_bot_token() {
        let sources = sources(&[]);
        let err = Config::from_sources(&sources).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn defaults_to_socket_mode_and_reaction_approval() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
        ]);
        let cfg = Config::from_sources(&sources).expect("valid config");
        assert_eq!(cfg.listener_mode, ListenerMode::Socket);
        assert_eq!(cfg.approval_mode, ApprovalMode::Reaction);
        assert!(cfg.dry_run);
        assert_eq!(cfg.poll_batch_size, 100);
    }

    #[test]
    fn run_mode_forces_approval_none() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("RUN_MODE", "run"),
        ]);
        let cfg = Config::from_sources(&sources).expect("valid config");
        assert_eq!(cfg.approval_mode, ApprovalMode::None);
    }

    #[test]
    fn reaction_approval_requires_socket_listener() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("LISTENER_MODE", "poll"),
            ("APPROVAL_MODE", "reaction"),
        ]);
        let err = Config::from_sources(&sources).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn mode_values_are_case_sensitive() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("LISTENER_MODE", "SOCKET"),
        ]);
        let err = Config::from_sources(&sources).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_oversized_poll_batch() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("LISTENER_MODE", "poll"),
            ("APPROVAL_MODE", "none"),
            ("POLL_BATCH_SIZE", "500"),
        ]);
        let err = Config::from_sources(&sources).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_equal_reactions() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("APPROVE_REACTION", ":tada:"),
            ("REJECT_REACTION", "tada"),
        ]);
        let err = Config::from_sources(&sources).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn default_shell_allowlist_has_thirty_eight_entries() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
        ]);
        let cfg = Config::from_sources(&sources).expect("valid config");
        assert_eq!(cfg.shell_allowlist.len(), 38);
        assert!(cfg.shell_allowlist.contains(&"git".to_owned()));
    }

    #[test]
    fn empty_agent_response_instruction_disables_it() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
            ("AGENT_RESPONSE_INSTRUCTION", ""),
        ]);
        let cfg = Config::from_sources(&sources).expect("valid config");
        assert_eq!(cfg.agent_response_instruction, "");
    }

    #[test]
    fn absent_agent_response_instruction_uses_default() {
        let sources = sources(&[
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_APP_TOKEN", "xapp-1"),
            ("COMMAND_CHANNEL_ID", "C1"),
            ("REPORT_CHANNEL_ID", "C2"),
        ]);
        let cfg = Config::from_sources(&sources).expect("valid config");
        assert_eq!(cfg.agent_response_instruction, DEFAULT_AGENT_RESPONSE_INSTRUCTION);
    }
}
