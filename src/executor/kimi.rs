//! `kimi:` dispatch: the Kimi coding-agent CLI.

use crate::approval::new_session_id;
use crate::models::TaskPayload;
use crate::Result;

use super::{assemble_prompt, outcome_from_raw, run_subprocess, ExecutionOutcome, Executor};

const AGENT: &str = "kimi";
const YOLO_MODES: &[&str] = &["yolo", "auto", "yes"];

pub(super) async fn run(
    executor: &Executor,
    task: &TaskPayload,
    prompt: &str,
) -> Result<ExecutionOutcome> {
    let prompt = prompt.trim();
    let session_id = executor
        .sessions
        .get_session(&task.channel_id, &task.thread_ts, AGENT)
        .await?
        .map(|session| session.session_id)
        .unwrap_or_else(new_session_id);

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

    let mut args = vec!["--quiet".to_owned()];
    if let Some(workdir) = &executor.workdir {
        args.push("-w".to_owned());
        args.push(workdir.display().to_string());
    }
    if YOLO_MODES.contains(&executor.config.kimi_permission_mode.as_str()) {
        args.push("--yolo".to_owned());
    }
    args.push("-S".to_owned());
    args.push(session_id.clone());
    args.push("-p".to_owned());
    args.push(final_prompt);

    let raw = run_subprocess(AGENT, &args, executor.workdir.as_deref(), &[], executor.timeout()).await?;
    let outcome = outcome_from_raw(AGENT, &raw);

    if outcome.status == super::ExecutionStatus::Succeeded {
        executor
            .sessions
            .upsert_session(&task.channel_id, &task.thread_ts, AGENT, &session_id)
            .await?;
        executor
            .sessions
            .append_thread_context(&task.channel_id, &task.thread_ts, AGENT, prompt, &outcome.details)
            .await?;
    }

    Ok(outcome)
}
