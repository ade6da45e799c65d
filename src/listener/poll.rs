//! Poll-mode listener: periodic `conversations.history` pagination.

use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::SlackHistoryMessage;
use tracing::warn;

use crate::models::{EventBatch, SlackFile, SlackMessage};
use crate::persistence::checkpoint_repo::{last_ts_key, CheckpointRepo};
use crate::slack::SlackPoster;
use crate::Result;

use super::Listener;

/// Maximum `conversations.history` pages fetched per `receive` call, to
/// bound a single cycle's latency when a channel is unusually busy.
const MAX_PAGES: u32 = 3;

fn normalize_file(file: &slack_morphism::prelude::SlackFile) -> SlackFile {
    SlackFile {
        name: file.name.clone().unwrap_or_default(),
        mimetype: file.mimetype.clone().unwrap_or_default().to_string(),
        size_bytes: file.size.unwrap_or(0),
        url_private: file.url_private.clone().unwrap_or_default().to_string(),
    }
}

fn normalize_message(channel_id: &str, raw: &SlackHistoryMessage) -> Option<SlackMessage> {
    let ts = raw.origin.ts.0.clone();
    if ts.is_empty() {
        return None;
    }
    let user = raw
        .sender
        .user
        .as_ref()
        .map(|id| id.0.clone())
        .or_else(|| raw.sender.bot_id.as_ref().map(|id| id.0.clone()))
        .unwrap_or_else(|| "unknown".to_owned());
    let text = raw.content.text.clone().unwrap_or_default();
    let subtype = raw
        .subtype
        .as_ref()
        .map(|value| format!("{value:?}"))
        .unwrap_or_default();
    let files = raw
        .content
        .files
        .as_ref()
        .map(|files| files.iter().map(normalize_file).collect())
        .unwrap_or_default();

    Some(SlackMessage {
        channel_id: channel_id.to_owned(),
        ts: ts.clone(),
        thread_ts: raw.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
        user,
        text,
        subtype,
        files,
    })
}

fn parse_ts(ts: &str) -> f64 {
    ts.parse().unwrap_or(0.0)
}

/// Sort messages ascending by `ts`, per `EventBatch::messages`'s ordering
/// guarantee. `conversations.history` returns pages newest-first and pages
/// can interleave across cursors, so callers must not assume arrival order.
fn sort_by_ts(messages: &mut [SlackMessage]) {
    messages.sort_by(|a, b| parse_ts(&a.ts).total_cmp(&parse_ts(&b.ts)));
}

/// Periodically drains new `conversations.history` messages for one channel,
/// tracking progress via a persisted `last_ts:<channel_id>` checkpoint.
pub struct PollListener {
    poster: Arc<dyn SlackPoster>,
    checkpoints: Arc<CheckpointRepo>,
    channel_id: String,
    batch_size: u32,
}

impl PollListener {
    /// Build a listener bound to one command channel.
    #[must_use]
    pub fn new(
        poster: Arc<dyn SlackPoster>,
        checkpoints: Arc<CheckpointRepo>,
        channel_id: String,
        batch_size: u32,
    ) -> Self {
        Self {
            poster,
            checkpoints,
            channel_id,
            batch_size,
        }
    }

    async fn fetch_new_messages(&self) -> Result<Vec<SlackMessage>> {
        let key = last_ts_key(&self.channel_id);
        let oldest = self.checkpoints.get(&key).await?;
        let mut cursor: Option<String> = None;
        let mut collected = Vec::new();

        for _ in 0..MAX_PAGES {
            let page = self
                .poster
                .fetch_history(
                    &self.channel_id,
                    oldest.as_deref(),
                    cursor.as_deref(),
                    self.batch_size,
                )
                .await?;
            for raw in &page.messages {
                if let Some(message) = normalize_message(&self.channel_id, raw) {
                    collected.push(message);
                }
            }
            if page.has_more && page.next_cursor.is_some() {
                cursor = page.next_cursor;
            } else {
                break;
            }
        }

        sort_by_ts(&mut collected);

        if let Some(newest) = collected.last().map(|message| message.ts.clone()) {
            self.checkpoints.set(&key, &newest).await?;
        }

        Ok(collected)
    }
}

#[async_trait::async_trait]
impl Listener for PollListener {
    async fn receive(&mut self, timeout: Duration) -> Result<EventBatch> {
        tokio::time::sleep(timeout).await;
        match self.fetch_new_messages().await {
            Ok(messages) => Ok(EventBatch {
                messages,
                reactions: Vec::new(),
            }),
            Err(err) => {
                warn!(%err, "listen_error");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;
    use crate::slack::HistoryPage;
    use std::sync::Mutex;

    struct FakePoster {
        pages: Mutex<Vec<HistoryPage>>,
    }

    #[async_trait::async_trait]
    impl SlackPoster for FakePoster {
        async fn post_message(&self, _: &str, _: &str, _: Option<&str>) -> Result<String> {
            Ok("1.0".to_owned())
        }

        async fn fetch_history(
            &self,
            _channel_id: &str,
            _oldest: Option<&str>,
            _cursor: Option<&str>,
            _limit: u32,
        ) -> Result<HistoryPage> {
            let mut pages = self.pages.lock().expect("lock");
            Ok(if pages.is_empty() {
                HistoryPage::default()
            } else {
                pages.remove(0)
            })
        }
    }

    #[test]
    fn parse_ts_falls_back_to_zero_on_garbage() {
        assert_eq!(parse_ts("not-a-number"), 0.0);
        assert_eq!(parse_ts("1.5"), 1.5);
    }

    #[test]
    fn sort_by_ts_reorders_newest_first_pages_into_ascending_order() {
        fn message(ts: &str) -> SlackMessage {
            SlackMessage {
                channel_id: "C1".into(),
                ts: ts.into(),
                thread_ts: None,
                user: "U1".into(),
                text: String::new(),
                subtype: String::new(),
                files: Vec::new(),
            }
        }

        let mut messages = vec![message("100.3"), message("100.1"), message("100.2")];
        sort_by_ts(&mut messages);
        let order: Vec<&str> = messages.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(order, vec!["100.1", "100.2", "100.3"]);
    }

    #[tokio::test]
    async fn empty_history_returns_empty_batch_without_checkpoint_write() {
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let checkpoints = Arc::new(CheckpointRepo::new(db));
        let poster: Arc<dyn SlackPoster> = Arc::new(FakePoster {
            pages: Mutex::new(vec![HistoryPage::default()]),
        });
        let mut listener = PollListener::new(poster, Arc::clone(&checkpoints), "C1".into(), 50);

        let batch = listener.receive(Duration::from_millis(0)).await.expect("receive");
        assert!(batch.messages.is_empty());
        assert!(batch.reactions.is_empty());
        assert_eq!(checkpoints.get("last_ts:C1").await.expect("get"), None);
    }
}
