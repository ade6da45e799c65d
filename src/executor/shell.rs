//! `sh:` dispatch: runs the command through a shell interpreter.

use crate::models::TaskPayload;
use crate::Result;

use super::{outcome_from_raw, run_subprocess, ExecutionOutcome, Executor};

#[cfg(unix)]
const SHELL: &str = "/bin/sh";
#[cfg(unix)]
const SHELL_FLAG: &str = "-c";
#[cfg(windows)]
const SHELL: &str = "cmd";
#[cfg(windows)]
const SHELL_FLAG: &str = "/C";

pub(super) async fn run(
    executor: &Executor,
    task: &TaskPayload,
    command: &str,
) -> Result<ExecutionOutcome> {
    let mut extra_env = Vec::new();
    if !task.image_paths.is_empty() {
        extra_env.push(("SLACKCLAW_IMAGE_PATHS", task.image_paths.join("\n")));
        extra_env.push((
            "SLACKCLAW_IMAGE_COUNT",
            task.image_paths.len().to_string(),
        ));
    }

    let raw = run_subprocess(
        SHELL,
        &[SHELL_FLAG.to_owned(), command.to_owned()],
        executor.workdir.as_deref(),
        &extra_env,
        executor.timeout(),
    )
    .await?;

    Ok(outcome_from_raw(SHELL, &raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn echo_succeeds_and_captures_stdout() {
        let raw = run_subprocess(
            SHELL,
            &[SHELL_FLAG.to_owned(), "echo hi".to_owned()],
            None,
            &[],
            Duration::from_secs(5),
        )
        .await
        .expect("spawn");
        let outcome = outcome_from_raw(SHELL, &raw);
        assert_eq!(outcome.status, super::super::ExecutionStatus::Succeeded);
        assert_eq!(outcome.details, "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let raw = run_subprocess(
            SHELL,
            &[SHELL_FLAG.to_owned(), "exit 3".to_owned()],
            None,
            &[],
            Duration::from_secs(5),
        )
        .await
        .expect("spawn");
        let outcome = outcome_from_raw(SHELL, &raw);
        assert_eq!(outcome.status, super::super::ExecutionStatus::Failed);
        assert!(outcome.summary.contains('3'));
    }
}
