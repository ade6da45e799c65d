//! `codex:` dispatch: the Codex coding-agent CLI, with JSON-lines event
//! parsing and session resume.

use std::path::Path;

use serde_json::Value;

use crate::models::TaskPayload;
use crate::Result;

use super::{assemble_prompt, run_subprocess, ExecutionOutcome, ExecutionStatus, Executor};

const AGENT: &str = "codex";
const BYPASS_MODES: &[&str] = &["dangerous", "bypass", "dangerously-bypass-approvals-and-sandbox"];
const NOISY_STDERR_MARKER: &str = "state db missing rollout path for thread";

fn permission_flags(
    mode: &str,
    sandbox_mode: &str,
    workdir: Option<&Path>,
    include_sandbox: bool,
) -> Vec<String> {
    if BYPASS_MODES.contains(&mode) {
        return vec!["--dangerously-bypass-approvals-and-sandbox".to_owned()];
    }

    let mut flags = Vec::new();
    if mode == "full-auto" {
        flags.push("--full-auto".to_owned());
    }
    if include_sandbox {
        flags.push("--sandbox".to_owned());
        flags.push(sandbox_mode.to_owned());
        if let Some(dir) = workdir {
            flags.push("-C".to_owned());
            flags.push(dir.display().to_string());
        }
    }
    flags
}

/// Parse Codex's JSON-lines stdout, returning a new thread/session id (if a
/// `thread.started` event appeared) and the last `agent_message` text (if
/// any `item.completed` events carried one). Non-object or unparseable
/// lines are silently skipped.
fn parse_events(stdout: &str) -> (Option<String>, Option<String>) {
    let mut session_id = None;
    let mut last_message = None;

    for line in stdout.lines() {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match obj.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                if let Some(id) = obj.get("thread_id").and_then(Value::as_str) {
                    session_id = Some(id.to_owned());
                }
            }
            Some("item.completed") => {
                let is_agent_message = obj
                    .get("item")
                    .and_then(Value::as_object)
                    .and_then(|item| item.get("type"))
                    .and_then(Value::as_str)
                    == Some("agent_message");
                if is_agent_message {
                    if let Some(text) = obj
                        .get("item")
                        .and_then(Value::as_object)
                        .and_then(|item| item.get("text"))
                        .and_then(Value::as_str)
                    {
                        last_message = Some(text.to_owned());
                    }
                }
            }
            _ => {}
        }
    }

    (session_id, last_message)
}

fn non_json_lines(stdout: &str) -> Vec<&str> {
    stdout
        .lines()
        .filter(|line| serde_json::from_str::<Value>(line).is_err())
        .collect()
}

fn filtered_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.contains(NOISY_STDERR_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(super) async fn run(
    executor: &Executor,
    task: &TaskPayload,
    prompt: &str,
) -> Result<ExecutionOutcome> {
    let prompt = prompt.trim();
    let existing_session = executor
        .sessions
        .get_session(&task.channel_id, &task.thread_ts, AGENT)
        .await?;
    let thread_context = executor
        .sessions
        .get_thread_context(&task.channel_id, &task.thread_ts)
        .await?;
    let final_prompt = assemble_prompt(
        prompt,
        thread_context.as_deref(),
        &task.image_paths,
        &executor.config.agent_response_instruction,
    );

    let mode = executor.config.codex_permission_mode.as_str();
    let sandbox_mode = executor.config.codex_sandbox_mode.as_str();

    let mut args = vec!["exec".to_owned()];
    if let Some(session) = &existing_session {
        args.push("resume".to_owned());
        args.extend(permission_flags(mode, sandbox_mode, None, false));
        args.push("--skip-git-repo-check".to_owned());
        args.push("--json".to_owned());
        args.push(session.session_id.clone());
        args.push(final_prompt);
    } else {
        args.extend(permission_flags(
            mode,
            sandbox_mode,
            executor.workdir.as_deref(),
            true,
        ));
        args.push("--skip-git-repo-check".to_owned());
        args.push("--json".to_owned());
        args.push(final_prompt);
    }

    let raw = run_subprocess(AGENT, &args, executor.workdir.as_deref(), &[], executor.timeout()).await?;

    if raw.timed_out {
        return Ok(ExecutionOutcome {
            status: ExecutionStatus::Failed,
            summary: format!("{AGENT} timed out"),
            details: String::new(),
        });
    }

    let (new_session_id, agent_message) = parse_events(&raw.stdout);
    let stderr = filtered_stderr(&raw.stderr);
    let details = agent_message.clone().unwrap_or_else(|| {
        let fallback = non_json_lines(&raw.stdout).join("\n");
        if fallback.is_empty() {
            stderr.clone()
        } else {
            fallback
        }
    });

    let (status, summary) = match raw.exit_code {
        Some(0) => (ExecutionStatus::Succeeded, "ok".to_owned()),
        Some(code) => (ExecutionStatus::Failed, format!("exit code {code}")),
        None => (
            ExecutionStatus::Failed,
            format!("{AGENT} terminated by signal"),
        ),
    };

    let outcome = ExecutionOutcome {
        status,
        summary,
        details,
    };

    if outcome.status == ExecutionStatus::Succeeded {
        let session_to_persist =
            new_session_id.or_else(|| existing_session.map(|session| session.session_id));
        if let Some(session_id) = session_to_persist {
            executor
                .sessions
                .upsert_session(&task.channel_id, &task.thread_ts, AGENT, &session_id)
                .await?;
        }
        executor
            .sessions
            .append_thread_context(&task.channel_id, &task.thread_ts, AGENT, prompt, &outcome.details)
            .await?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_mode_skips_sandbox_and_workdir() {
        let flags = permission_flags("dangerously-bypass-approvals-and-sandbox", "workspace-write", Some(Path::new("/tmp")), true);
        assert_eq!(flags, vec!["--dangerously-bypass-approvals-and-sandbox".to_owned()]);
    }

    #[test]
    fn full_auto_still_gets_sandbox_when_included() {
        let flags = permission_flags("full-auto", "workspace-write", Some(Path::new("/tmp")), true);
        assert!(flags.contains(&"--full-auto".to_owned()));
        assert!(flags.contains(&"--sandbox".to_owned()));
        assert!(flags.contains(&"-C".to_owned()));
    }

    #[test]
    fn resume_omits_sandbox_even_for_full_auto() {
        let flags = permission_flags("full-auto", "workspace-write", None, false);
        assert!(flags.contains(&"--full-auto".to_owned()));
        assert!(!flags.contains(&"--sandbox".to_owned()));
    }

    #[test]
    fn parse_events_extracts_session_and_last_message() {
        let stdout = r#"{"type":"thread.started","thread_id":"thread-1"}
not json at all
{"type":"item.completed","item":{"type":"agent_message","text":"first"}}
{"type":"item.completed","item":{"type":"agent_message","text":"second"}}
"#;
        let (session, message) = parse_events(stdout);
        assert_eq!(session.as_deref(), Some("thread-1"));
        assert_eq!(message.as_deref(), Some("second"));
    }

    #[test]
    fn filtered_stderr_drops_noisy_marker_lines() {
        let stderr = "real error\nstate db missing rollout path for thread abc\nother line";
        let result = filtered_stderr(stderr);
        assert!(!result.contains("state db missing"));
        assert!(result.contains("real error"));
        assert!(result.contains("other line"));
    }
}
