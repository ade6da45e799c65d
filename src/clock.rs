//! Wall-clock time and deterministic task identifiers.

use sha2::{Digest, Sha256};

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Derive the deterministic 16-hex-digit task id for a command message.
///
/// `task_id = sha256(f"{channel_id}:{message_ts}:{raw_text}")[:16]` as
/// lowercase hex, computed over the **raw, untouched** message text rather
/// than the post-trigger command text, so that replayed or re-polled copies
/// of the same Slack message always collapse to the same task.
#[must_use]
pub fn task_id(channel_id: &str, message_ts: &str, raw_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    hasher.update(b":");
    hasher.update(message_ts.as_bytes());
    hasher.update(b":");
    hasher.update(raw_text.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..16].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let a = task_id("C111", "1.1", "!do lock:repo-a sh:echo hi");
        let b = task_id("C111", "1.1", "!do lock:repo-a sh:echo hi");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn differs_for_different_text() {
        let a = task_id("C111", "1.1", "!do echo hi");
        let b = task_id("C111", "1.1", "!do echo bye");
        assert_ne!(a, b);
    }
}
