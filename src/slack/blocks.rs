//! Plain-text Slack message formatting.
//!
//! Approval gating is reaction-driven, not Block-Kit-driven, so messages
//! here are Slack-Markdown strings rather than Block Kit layouts.

/// Format the plan message posted when a task enters `waiting_approval`.
///
/// Includes the task id, command text, lock key, optional reason (e.g. a
/// non-allowlisted shell command), the number of image attachments, and the
/// reaction names to use.
#[must_use]
pub fn plan_message(
    task_id: &str,
    command_text: &str,
    lock_key: &str,
    reason: Option<&str>,
    image_count: usize,
    approve_reaction: &str,
    reject_reaction: &str,
) -> String {
    let mut lines = vec![
        "*Approval requested*".to_owned(),
        format!("Task: `{task_id}`"),
        format!("Command: `{command_text}`"),
        format!("Lock: `{lock_key}`"),
    ];
    if let Some(reason) = reason {
        lines.push(format!("Reason: {reason}"));
    }
    if image_count > 0 {
        lines.push(format!("Images attached: {image_count}"));
    }
    lines.push(format!(
        "React with :{approve_reaction}: to approve or :{reject_reaction}: to reject."
    ));
    lines.join("\n")
}

/// Format the notice posted when an approval is rejected.
#[must_use]
pub fn rejected_message(task_id: &str, decided_by: &str) -> String {
    format!("Task `{task_id}` was rejected by <@{decided_by}>; it will not run.")
}
