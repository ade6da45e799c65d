//! Approval Manager: reaction-driven gating of decided tasks before they
//! reach the task queue.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{ApprovalMode, Config};
use crate::decider::TaskSpec;
use crate::models::ApprovalStatus;
use crate::persistence::approval_repo::ApprovalRepo;
use crate::slack::blocks::{plan_message, rejected_message};
use crate::slack::SlackPoster;
use crate::{AppError, Result};

/// Shell wrapper commands whose presence is transparent to the allowlist
/// check; their own leading `VAR=value` assignments are skipped too.
const WRAPPER_COMMANDS: &[&str] = &["sudo", "command", "time", "nohup"];

/// Split a compound shell command into its pipeline/chain segments on
/// `&&`, `||`, `;`, and `|`.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            '|' | ';' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

/// Tokenize a single shell segment with simple POSIX-style quoting rules
/// (single and double quotes group whitespace; no escape processing beyond
/// that, which matches the needs of allowlist inspection, not execution).
fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                other => {
                    current.push(other);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn is_assignment(token: &str) -> bool {
    let Some((name, _)) = token.split_once('=') else {
        return false;
    };
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn effective_command(tokens: &[String]) -> Option<String> {
    let mut rest = tokens;
    while let Some(first) = rest.first() {
        if is_assignment(first) {
            rest = &rest[1..];
            continue;
        }
        break;
    }

    let first = rest.first()?;
    let basename = first.rsplit(['/', '\\']).next().unwrap_or(first.as_str());
    let lowered = basename.to_ascii_lowercase();

    if WRAPPER_COMMANDS.contains(&lowered.as_str()) {
        let mut rest = &rest[1..];
        while let Some(first) = rest.first() {
            if is_assignment(first) {
                rest = &rest[1..];
                continue;
            }
            break;
        }
        let first = rest.first()?;
        let basename = first.rsplit(['/', '\\']).next().unwrap_or(first.as_str());
        return Some(basename.to_ascii_lowercase());
    }

    Some(lowered)
}

/// Return the effective command names in `command_text` that are not present
/// in `allowlist`, in first-seen order. An empty result means every
/// effective command is allowed.
#[must_use]
pub fn disallowed_commands(command_text: &str, allowlist: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut disallowed = Vec::new();
    for segment in split_segments(command_text) {
        let tokens = tokenize(&segment);
        if tokens.is_empty() {
            continue;
        }
        let Some(command) = effective_command(&tokens) else {
            continue;
        };
        if !allowlist.iter().any(|allowed| allowed == &command) && seen.insert(command.clone()) {
            disallowed.push(command);
        }
    }
    disallowed
}

/// Outcome of gating a decided task through the approval manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// No gating required; the caller should `upsert_task(pending)` and
    /// enqueue immediately.
    EnqueueImmediately,
    /// The task is now `waiting_approval`; a plan message was posted and
    /// its ts recorded as `approval_message_ts`.
    WaitingApproval {
        /// ts of the posted plan message.
        approval_message_ts: String,
    },
}

/// Outcome of resolving a reaction event against pending approvals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The approval was resolved to `approved`; the caller should
    /// `upsert_task(pending)` and enqueue.
    Approved {
        /// The task the approval gated.
        task_id: String,
    },
    /// The approval was resolved to `rejected`; the caller should mark the
    /// task `canceled` and report.
    Rejected {
        /// The task the approval gated.
        task_id: String,
    },
    /// No pending approval matched, or it had already been resolved.
    NoOp,
}

/// Coordinates the reaction-driven approval state machine.
pub struct ApprovalManager {
    repo: Arc<ApprovalRepo>,
    poster: Arc<dyn SlackPoster>,
    approval_mode: ApprovalMode,
    shell_allowlist: Vec<String>,
    approve_reaction: String,
    reject_reaction: String,
}

impl ApprovalManager {
    /// Build a manager bound to a config snapshot.
    #[must_use]
    pub fn new(repo: Arc<ApprovalRepo>, poster: Arc<dyn SlackPoster>, config: &Config) -> Self {
        Self {
            repo,
            poster,
            approval_mode: config.approval_mode,
            shell_allowlist: config.shell_allowlist.clone(),
            approve_reaction: config.approve_reaction.clone(),
            reject_reaction: config.reject_reaction.clone(),
        }
    }

    /// Gate a decided task, posting a plan message if approval is required.
    ///
    /// A shell command (`sh:` prefix) fully within the allowlist is never
    /// gated, even in reaction mode; every other command is gated whenever
    /// `approval_mode` is `reaction`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Approval` if posting the plan message fails, or
    /// `AppError::Db` if persisting the approval record fails.
    pub async fn gate(&self, task: &TaskSpec, image_count: usize) -> Result<GateOutcome> {
        if matches!(self.approval_mode, ApprovalMode::None) {
            return Ok(GateOutcome::EnqueueImmediately);
        }

        let reason = shell_gate_reason(&task.command_text, &self.shell_allowlist);
        if task.command_text.starts_with("sh:") && reason.is_none() {
            return Ok(GateOutcome::EnqueueImmediately);
        }

        let text = plan_message(
            &task.task_id,
            &task.command_text,
            &task.lock_key,
            reason.as_deref(),
            image_count,
            &self.approve_reaction,
            &self.reject_reaction,
        );
        let approval_message_ts = self
            .poster
            .post_message(&task.channel_id, &text, Some(&task.thread_ts))
            .await
            .map_err(|err| AppError::Approval(format!("failed to post plan message: {err}")))?;

        self.repo
            .upsert(
                &task.task_id,
                &task.channel_id,
                &task.message_ts,
                &approval_message_ts,
                &self.approve_reaction,
                &self.reject_reaction,
                ApprovalStatus::Pending,
            )
            .await?;

        Ok(GateOutcome::WaitingApproval {
            approval_message_ts,
        })
    }

    /// Resolve a reaction event against any pending approval on `channel_id`
    /// whose source or plan message matches `ts`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lookup or resolution write fails.
    pub async fn handle_reaction(
        &self,
        channel_id: &str,
        ts: &str,
        reaction: &str,
        user: &str,
    ) -> Result<ResolutionOutcome> {
        let Some(record) = self.repo.get_pending_for_message(channel_id, ts).await? else {
            return Ok(ResolutionOutcome::NoOp);
        };

        let target_status = if reaction == record.approve_reaction {
            ApprovalStatus::Approved
        } else if reaction == record.reject_reaction {
            ApprovalStatus::Rejected
        } else {
            return Ok(ResolutionOutcome::NoOp);
        };

        let resolved = self
            .repo
            .resolve(&record.task_id, target_status, user, reaction)
            .await?;
        if !resolved {
            return Ok(ResolutionOutcome::NoOp);
        }

        if matches!(target_status, ApprovalStatus::Rejected) {
            let text = rejected_message(&record.task_id, user);
            self.poster
                .post_message(channel_id, &text, Some(&record.source_message_ts))
                .await
                .ok();
            return Ok(ResolutionOutcome::Rejected {
                task_id: record.task_id,
            });
        }

        Ok(ResolutionOutcome::Approved {
            task_id: record.task_id,
        })
    }
}

fn shell_gate_reason(command_text: &str, allowlist: &[String]) -> Option<String> {
    let body = command_text.strip_prefix("sh:")?;
    let disallowed = disallowed_commands(body, allowlist);
    if disallowed.is_empty() {
        return None;
    }
    Some(format!(
        "non-allowlisted shell command(s): {}",
        disallowed.join(", ")
    ))
}

/// Generate a random 128-bit session id for an agent CLI that has no prior
/// resumable session.
#[must_use]
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_plain_allowlisted_command() {
        let allowlist = vec!["echo".to_owned(), "ls".to_owned()];
        assert!(disallowed_commands("echo hi", &allowlist).is_empty());
    }

    #[test]
    fn flags_disallowed_command_in_chain() {
        let allowlist = vec!["echo".to_owned()];
        let result = disallowed_commands("echo hi && rm -rf /tmp/x", &allowlist);
        assert_eq!(result, vec!["rm".to_owned()]);
    }

    #[test]
    fn skips_leading_assignment_and_wrapper() {
        let allowlist = vec!["git".to_owned()];
        let result = disallowed_commands("FOO=bar sudo BAZ=1 git status", &allowlist);
        assert!(result.is_empty());
    }

    #[test]
    fn splits_on_pipe_and_semicolon() {
        let allowlist = vec!["cat".to_owned(), "grep".to_owned()];
        let result = disallowed_commands("cat file | grep x; echo done", &allowlist);
        assert_eq!(result, vec!["echo".to_owned()]);
    }

    #[test]
    fn basename_of_absolute_path_is_checked() {
        let allowlist = vec!["git".to_owned()];
        assert!(disallowed_commands("/usr/bin/git status", &allowlist).is_empty());
    }

    #[test]
    fn shell_gate_reason_only_applies_to_shell_prefix() {
        let allowlist = vec!["echo".to_owned()];
        assert!(shell_gate_reason("codex:do the thing", &allowlist).is_none());
        assert!(shell_gate_reason("sh:echo hi", &allowlist).is_none());
        assert!(shell_gate_reason("sh:rm -rf /", &allowlist).is_some());
    }
}
