//! Posts one final message to the report channel per task completion.

use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::executor::{ExecutionOutcome, ExecutionStatus};
use crate::models::TaskPayload;
use crate::slack::SlackPoster;
use crate::Result;

const DETAILS_CHUNK_SIZE: usize = 2800;
const MAX_DETAILS_CHUNKS: usize = 30;

fn trim_to(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_owned();
    }
    let keep = max_chars.saturating_sub(3);
    let truncated: String = text.chars().take(keep).collect();
    format!("{truncated}...")
}

fn status_icon_and_label(status: ExecutionStatus) -> (&'static str, &'static str) {
    match status {
        ExecutionStatus::Succeeded => (":white_check_mark:", "succeeded"),
        ExecutionStatus::Failed => (":x:", "failed"),
        ExecutionStatus::Canceled => (":no_entry_sign:", "canceled"),
    }
}

fn chunk_details(details: &str, chunk_size: usize, max_chunks: usize) -> Vec<String> {
    if details.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = details.chars().collect();
    chars
        .chunks(chunk_size)
        .take(max_chunks)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Formats and posts the final report message for a completed task.
pub struct Reporter {
    poster: Arc<dyn SlackPoster>,
    report_channel_id: String,
    input_max_chars: usize,
    summary_max_chars: usize,
    details_max_chars: usize,
}

impl Reporter {
    /// Build a reporter bound to a config snapshot.
    #[must_use]
    pub fn new(poster: Arc<dyn SlackPoster>, config: &Config) -> Self {
        Self {
            poster,
            report_channel_id: config.report_channel_id.clone(),
            input_max_chars: config.report_input_max_chars,
            summary_max_chars: config.report_summary_max_chars,
            details_max_chars: config.report_details_max_chars,
        }
    }

    /// Format and post the completion message for `task_id`/`payload` with
    /// `outcome`. Failures are swallowed and logged as `report_failed`; per
    /// `spec.md` §4.8 a report failure never changes task status.
    pub async fn report(&self, task_id: &str, payload: &TaskPayload, outcome: &ExecutionOutcome) {
        let text = self.format(task_id, payload, outcome);
        if let Err(err) = self
            .poster
            .post_message(&self.report_channel_id, &text, Some(&payload.thread_ts))
            .await
        {
            warn!(task_id, %err, "report_failed");
        }
    }

    /// Post a standalone rejection notice (no execution outcome exists yet).
    pub async fn report_rejected(&self, task_id: &str, payload: &TaskPayload, decided_by: &str) {
        let text = format!(
            "{icon} Task `{task_id}` {label}\nChannel: `{channel}` (ts `{ts}`)\nThread: `{thread}`\nTriggered by: <@{user}>\nCommand: `{command}`\nRejected by: <@{decided_by}>",
            icon = ":no_entry_sign:",
            label = "canceled",
            channel = payload.channel_id,
            ts = payload.message_ts,
            thread = payload.thread_ts,
            user = payload.trigger_user,
            command = trim_to(&payload.command_text, self.input_max_chars),
        );
        if let Err(err) = self
            .poster
            .post_message(&self.report_channel_id, &text, Some(&payload.thread_ts))
            .await
        {
            warn!(task_id, %err, "report_failed");
        }
    }

    fn format(&self, task_id: &str, payload: &TaskPayload, outcome: &ExecutionOutcome) -> String {
        let (icon, label) = status_icon_and_label(outcome.status);
        let command = trim_to(&payload.command_text, self.input_max_chars);
        let summary = trim_to(&outcome.summary, self.summary_max_chars);
        let details = trim_to(&outcome.details, self.details_max_chars);

        let mut lines = vec![
            format!("{icon} Task `{task_id}` {label}"),
            format!("Channel: `{}` (ts `{}`)", payload.channel_id, payload.message_ts),
            format!("Thread: `{}`", payload.thread_ts),
            format!("Triggered by: <@{}>", payload.trigger_user),
            format!("Command: `{command}`"),
            format!("Summary: {summary}"),
        ];

        for chunk in chunk_details(&details, DETAILS_CHUNK_SIZE, MAX_DETAILS_CHUNKS) {
            lines.push(format!("```\n{chunk}\n```"));
        }

        lines.join("\n")
    }
}
