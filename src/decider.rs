//! Pure decision function: a normalized Slack message in, either an ignore
//! reason or a fully formed [`TaskSpec`] out.

use std::sync::LazyLock;

use regex::Regex;

use crate::clock::task_id;
use crate::config::{Config, TriggerMode};
use crate::models::SlackMessage;

static LOCK_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^lock:([^\s]+)\s+(.*)$").expect("valid regex"));
static SHELL_CD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*sh:\s*cd\s+([^\s;&]+)").expect("valid regex"));
static SIMPLE_SHELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^shell\s+(.+)$").expect("valid regex"));
static SIMPLE_KIMI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^kimi\s+(.+)$").expect("valid regex"));
static SIMPLE_CODEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^codex\s+(.+)$").expect("valid regex"));
static SIMPLE_CLAUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^claude\s+(.+)$").expect("valid regex"));

/// A fully formed task ready to be persisted and enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Deterministic task id.
    pub task_id: String,
    /// Channel the command message was posted in.
    pub channel_id: String,
    /// ts of the command message.
    pub message_ts: String,
    /// Root ts of the thread the command belongs to.
    pub thread_ts: String,
    /// Slack user id who posted the command.
    pub trigger_user: String,
    /// Raw, untouched text of the command message.
    pub trigger_text: String,
    /// Command text after trigger and lock-prefix stripping.
    pub command_text: String,
    /// Serialization key for execution.
    pub lock_key: String,
}

/// The outcome of deciding a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The message does not produce a task.
    Ignore {
        /// Human-readable reason, useful for diagnostics/logging only.
        reason: String,
    },
    /// The message produces a task ready to be persisted.
    Run {
        /// The derived task.
        task: TaskSpec,
    },
}

fn starts_with_mention(text: &str, bot_user_id: &str) -> Option<String> {
    let mention = format!("<@{bot_user_id}>");
    let stripped = text.trim();
    let remainder = stripped.strip_prefix(mention.as_str())?;
    Some(remainder.trim().to_owned())
}

fn extract_lock_key(command_text: &str) -> (String, String) {
    if let Some(captures) = LOCK_PREFIX_RE.captures(command_text) {
        let lock_name = captures[1].trim();
        let remainder = captures[2].trim();
        if !lock_name.is_empty() {
            return (format!("lock:{lock_name}"), remainder.to_owned());
        }
    }

    if let Some(captures) = SHELL_CD_RE.captures(command_text) {
        let path = captures[1].trim();
        if !path.is_empty() {
            return (format!("path:{path}"), command_text.to_owned());
        }
    }

    ("global".to_owned(), command_text.to_owned())
}

fn parse_simple_command(text: &str) -> Option<String> {
    if let Some(captures) = SIMPLE_SHELL_RE.captures(text) {
        let command = captures[1].trim();
        if !command.is_empty() {
            return Some(format!("sh:{command}"));
        }
    }
    if let Some(captures) = SIMPLE_KIMI_RE.captures(text) {
        let prompt = captures[1].trim();
        if !prompt.is_empty() {
            return Some(format!("kimi:{prompt}"));
        }
    }
    if let Some(captures) = SIMPLE_CODEX_RE.captures(text) {
        let prompt = captures[1].trim();
        if !prompt.is_empty() {
            return Some(format!("codex:{prompt}"));
        }
    }
    if let Some(captures) = SIMPLE_CLAUDE_RE.captures(text) {
        let prompt = captures[1].trim();
        if !prompt.is_empty() {
            return Some(format!("claude:{prompt}"));
        }
    }
    None
}

fn ignore(reason: impl Into<String>) -> Decision {
    Decision::Ignore {
        reason: reason.into(),
    }
}

/// Decide whether a normalized Slack message produces a task, following the
/// rule order in `spec.md` §4.3.
#[must_use]
pub fn decide_message(config: &Config, message: &SlackMessage) -> Decision {
    if !message.subtype.is_empty() {
        return ignore(format!("ignored subtype={}", message.subtype));
    }

    let text = message.text.trim();
    if text.is_empty() {
        return ignore("ignored empty text");
    }

    let mut command_text = parse_simple_command(text);
    if command_text.is_none() {
        command_text = match config.trigger_mode {
            TriggerMode::Prefix => {
                if !text.starts_with(config.trigger_prefix.as_str()) {
                    return ignore("no prefix trigger");
                }
                Some(text[config.trigger_prefix.len()..].trim().to_owned())
            }
            TriggerMode::Mention => {
                let Some(bot_user_id) = config.bot_user_id.as_deref() else {
                    return ignore("mention trigger requires bot_user_id");
                };
                match starts_with_mention(text, bot_user_id) {
                    Some(remainder) => Some(remainder),
                    None => return ignore("no mention trigger"),
                }
            }
        };
    }

    let Some(command_text) = command_text.filter(|c| !c.is_empty()) else {
        return ignore("empty command after trigger");
    };

    let (lock_key, command_text) = extract_lock_key(&command_text);
    if command_text.is_empty() {
        return ignore("empty command after lock prefix");
    }

    let task_id = task_id(&message.channel_id, &message.ts, &message.text);
    let thread_ts = message
        .thread_ts
        .clone()
        .unwrap_or_else(|| message.ts.clone());

    Decision::Run {
        task: TaskSpec {
            task_id,
            channel_id: message.channel_id.clone(),
            message_ts: message.ts.clone(),
            thread_ts,
            trigger_user: message.user.clone(),
            trigger_text: message.text.clone(),
            command_text,
            lock_key,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            slack_bot_token: "xoxb".into(),
            slack_app_token: Some("xapp".into()),
            command_channel_id: "C111".into(),
            report_channel_id: "C222".into(),
            listener_mode: crate::config::ListenerMode::Socket,
            poll_interval_seconds: 3.0,
            poll_batch_size: 100,
            socket_read_timeout_seconds: 1.0,
            trigger_mode: TriggerMode::Prefix,
            trigger_prefix: "!do".into(),
            bot_user_id: Some("UBOT".into()),
            state_db_path: PathBuf::from("./state.db"),
            exec_timeout_seconds: 120,
            dry_run: true,
            run_mode: crate::config::RunMode::Approve,
            approval_mode: crate::config::ApprovalMode::Reaction,
            approve_reaction: "white_check_mark".into(),
            reject_reaction: "x".into(),
            shell_allowlist: vec!["echo".into(), "ls".into()],
            worker_processes: 1,
            kimi_permission_mode: "conservative".into(),
            codex_permission_mode: "conservative".into(),
            codex_sandbox_mode: "workspace-write".into(),
            claude_permission_mode: "conservative".into(),
            agent_response_instruction: String::new(),
            report_input_max_chars: 500,
            report_summary_max_chars: 1200,
            report_details_max_chars: 4000,
        }
    }

    fn message(text: &str, ts: &str) -> SlackMessage {
        SlackMessage {
            channel_id: "C111".into(),
            ts: ts.into(),
            thread_ts: None,
            user: "U1".into(),
            text: text.into(),
            subtype: String::new(),
            files: Vec::new(),
        }
    }

    #[test]
    fn prefix_trigger_with_lock() {
        let config = base_config();
        let msg = message("!do lock:repo-a sh:echo hi", "1.1");
        let Decision::Run { task } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(task.command_text, "sh:echo hi");
        assert_eq!(task.lock_key, "lock:repo-a");
        assert_eq!(task.thread_ts, "1.1");
    }

    #[test]
    fn shortcut_forms_bypass_trigger() {
        let config = base_config();
        let msg = message("shell echo hi", "1.2");
        let Decision::Run { task } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(task.command_text, "sh:echo hi");
        assert_eq!(task.lock_key, "global");
    }

    #[test]
    fn shell_cd_infers_path_lock() {
        let config = base_config();
        let msg = message("!do sh:cd /srv/app && ls", "1.3");
        let Decision::Run { task } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(task.lock_key, "path:/srv/app");
        assert_eq!(task.command_text, "sh:cd /srv/app && ls");
    }

    #[test]
    fn ignores_system_subtype() {
        let config = base_config();
        let mut msg = message("!do echo hi", "1.4");
        msg.subtype = "channel_join".into();
        assert!(matches!(decide_message(&config, &msg), Decision::Ignore { .. }));
    }

    #[test]
    fn ignores_untriggered_text() {
        let config = base_config();
        let msg = message("just chatting", "1.5");
        assert!(matches!(decide_message(&config, &msg), Decision::Ignore { .. }));
    }

    #[test]
    fn mention_trigger_mode() {
        let mut config = base_config();
        config.trigger_mode = TriggerMode::Mention;
        let msg = message("<@UBOT> echo hi", "1.6");
        let Decision::Run { task } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(task.command_text, "echo hi");
    }

    #[test]
    fn task_id_is_deterministic_over_raw_text() {
        let config = base_config();
        let msg = message("!do echo hi", "1.7");
        let Decision::Run { task: a } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        let Decision::Run { task: b } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(a.task_id, b.task_id);
    }

    #[test]
    fn thread_ts_falls_back_to_message_ts() {
        let config = base_config();
        let mut msg = message("!do echo hi", "1.8");
        msg.thread_ts = Some("1.0".into());
        let Decision::Run { task } = decide_message(&config, &msg) else {
            panic!("expected run decision");
        };
        assert_eq!(task.thread_ts, "1.0");
    }
}
