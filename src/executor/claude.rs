//! `claude:` dispatch: the Claude coding-agent CLI.
//!
//! Claude has no resumable-session contract in scope here, so unlike Kimi
//! and Codex this adapter does not read or persist `agent_sessions`.

use crate::models::TaskPayload;
use crate::Result;

use super::{assemble_prompt, outcome_from_raw, run_subprocess, ExecutionOutcome, Executor};

const AGENT: &str = "claude";

pub(super) async fn run(
    executor: &Executor,
    task: &TaskPayload,
    prompt: &str,
) -> Result<ExecutionOutcome> {
    let prompt = prompt.trim();
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

    let mut args = vec!["-p".to_owned()];
    if !executor.config.claude_permission_mode.is_empty() {
        args.push("--permission-mode".to_owned());
        args.push(executor.config.claude_permission_mode.clone());
    }
    if let Some(workdir) = &executor.workdir {
        args.push("--add-dir".to_owned());
        args.push(workdir.display().to_string());
    }
    args.push("--".to_owned());
    args.push(final_prompt);

    let raw = run_subprocess(AGENT, &args, executor.workdir.as_deref(), &[], executor.timeout()).await?;
    let outcome = outcome_from_raw(AGENT, &raw);

    if outcome.status == super::ExecutionStatus::Succeeded {
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
    fn agent_name_is_claude() {
        assert_eq!(AGENT, "claude");
    }
}
