//! Runs a decided task's command as a local subprocess, enforcing a
//! wall-clock timeout and parsing agent CLI output into a flat result.
//!
//! Dispatch is by the `sh:`/`kimi:`/`codex:`/`claude:` prefix the
//! [`crate::decider`] attaches to `command_text`; anything else is a
//! no-op success. The subprocess helper strips the inherited environment
//! and re-injects only a small allowlist, the same pattern the Slack
//! bridge's ACP-era spawner used for long-lived agent processes, adapted
//! here to a one-shot run-to-completion invocation.

mod claude;
mod codex;
mod kimi;
mod shell;

use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::config::Config;
use crate::models::TaskPayload;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

/// Environment variables inherited by spawned subprocesses. Everything
/// else — Slack tokens, the database path, agent CLI credentials set as
/// ambient env vars on the host — is stripped via `env_clear()` first.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Outcome of running a task's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Completed without error.
    Succeeded,
    /// Completed with an error, timed out, or failed to spawn.
    Failed,
    /// Not run; reserved for paths that cancel before dispatch.
    Canceled,
}

/// The result `execute` reports back to the orchestrator and Reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// succeeded/failed/canceled.
    pub status: ExecutionStatus,
    /// One-line label, e.g. an exit code or timeout note.
    pub summary: String,
    /// Captured stdout/stderr or agent response text.
    pub details: String,
}

impl ExecutionOutcome {
    fn succeeded(summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            summary: summary.into(),
            details: details.into(),
        }
    }

    fn failed(summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            summary: summary.into(),
            details: details.into(),
        }
    }
}

/// Raw captured output of a completed (or timed-out) subprocess.
pub(crate) struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Spawn `program args...` with a stripped environment plus `extra_env`,
/// an optional working directory, and a wall-clock timeout.
///
/// On timeout the in-flight child is killed (`kill_on_drop`) and
/// `timed_out` is set rather than an error being returned, so callers can
/// produce a uniform `failed` outcome with a timeout summary.
pub(crate) async fn run_subprocess(
    program: &str,
    args: &[String],
    cwd: Option<&std::path::Path>,
    extra_env: &[(&str, String)],
    timeout: Duration,
) -> Result<RawOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(value) = env::var(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(RawOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            exit_code: output.status.code(),
            timed_out: false,
        }),
        Ok(Err(err)) => Err(AppError::Executor(format!(
            "failed to spawn {program}: {err}"
        ))),
        Err(_elapsed) => Ok(RawOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: true,
        }),
    }
}

fn join_details(stdout: &str, stderr: &str) -> String {
    [stdout, stderr]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn outcome_from_raw(program: &str, raw: &RawOutput) -> ExecutionOutcome {
    if raw.timed_out {
        return ExecutionOutcome::failed(format!("{program} timed out"), String::new());
    }
    let details = join_details(&raw.stdout, &raw.stderr);
    match raw.exit_code {
        Some(0) => ExecutionOutcome::succeeded("ok", details),
        Some(code) => ExecutionOutcome::failed(format!("exit code {code}"), details),
        None => ExecutionOutcome::failed(format!("{program} terminated by signal"), details),
    }
}

/// Build the final prompt text sent to an agent CLI, per `spec.md` §4.7:
/// thread context prefix, raw prompt, image-path suffix, then the
/// response-format instruction.
fn assemble_prompt(
    raw_prompt: &str,
    thread_context: Option<&str>,
    image_paths: &[String],
    response_instruction: &str,
) -> String {
    let mut prompt = String::new();
    if let Some(context) = thread_context.filter(|c| !c.is_empty()) {
        prompt.push_str(&format!(
            "Shared thread context from previous agent runs:\n{context}\n\nCurrent request:\n"
        ));
    }
    prompt.push_str(raw_prompt);
    if !image_paths.is_empty() {
        let list = image_paths
            .iter()
            .map(|path| format!("- {path}"))
            .collect::<Vec<_>>()
            .join("\n");
        prompt.push_str(&format!(
            "\n\nAttached image file paths available on local disk:\n{list}"
        ));
    }
    if !response_instruction.is_empty() {
        prompt.push_str(&format!(
            "\n\nResponse format requirements:\n{response_instruction}"
        ));
    }
    prompt
}

/// Runs a task's command, dispatching by its `sh:`/`kimi:`/`codex:`/`claude:`
/// prefix, honoring `dry_run` and the configured timeout.
pub struct Executor {
    config: Arc<Config>,
    sessions: Arc<SessionRepo>,
    workdir: Option<PathBuf>,
}

impl Executor {
    /// Build an executor bound to a frozen config snapshot. `AGENT_WORKDIR`
    /// is read once here (Design Note: executor settings are captured at
    /// construction, not at per-call read time) and used only if it exists
    /// as a directory.
    #[must_use]
    pub fn new(config: Arc<Config>, sessions: Arc<SessionRepo>) -> Self {
        let workdir = env::var("AGENT_WORKDIR")
            .ok()
            .map(PathBuf::from)
            .filter(|path| path.is_dir());
        Self {
            config,
            sessions,
            workdir,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.exec_timeout_seconds)
    }

    /// Execute `task`'s command per its prefix.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if reading or persisting session/thread-context
    /// state fails. Subprocess failures (timeout, non-zero exit, spawn
    /// failure) are reported via `ExecutionOutcome`, not `Err`.
    pub async fn execute(&self, task: &TaskPayload) -> Result<ExecutionOutcome> {
        if self.config.dry_run {
            return Ok(ExecutionOutcome::succeeded(
                "dry run",
                format!("would run: {}", task.command_text),
            ));
        }

        if let Some(command) = task.command_text.strip_prefix("sh:") {
            return shell::run(self, task, command).await;
        }
        if let Some(prompt) = task.command_text.strip_prefix("kimi:") {
            return kimi::run(self, task, prompt).await;
        }
        if let Some(prompt) = task.command_text.strip_prefix("codex:") {
            return codex::run(self, task, prompt).await;
        }
        if let Some(prompt) = task.command_text.strip_prefix("claude:") {
            return claude::run(self, task, prompt).await;
        }

        Ok(ExecutionOutcome::succeeded(
            "no-op",
            "command did not match a known dispatch prefix",
        ))
    }
}
