//! Thin Slack Web API client: the small set of operations the orchestrator,
//! approval manager, and reporter need (`chat.postMessage`,
//! `conversations.history`, `auth.test`), wrapped behind [`SlackPoster`] so
//! those layers can be exercised without a live token.

use std::time::Duration;

use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiConversationsHistoryRequest, SlackApiToken,
    SlackApiTokenType, SlackApiTokenValue, SlackChannelId, SlackClient,
    SlackClientHyperHttpsConnector, SlackHistoryMessage, SlackMessageContent, SlackTs,
};
use tokio::time::sleep;
use tracing::warn;

use crate::{AppError, Result};

/// One page of `conversations.history`.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Messages returned by this page, in Slack's native (descending) order.
    pub messages: Vec<SlackHistoryMessage>,
    /// Whether more history pages remain.
    pub has_more: bool,
    /// Cursor to pass as `cursor` on the next call, if `has_more`.
    pub next_cursor: Option<String>,
}

/// Minimal posting and history-reading surface used by the approval manager,
/// orchestrator, and reporter.
///
/// A trait so those layers can be unit tested with a fake implementation
/// instead of a live Slack workspace.
#[async_trait::async_trait]
pub trait SlackPoster: Send + Sync {
    /// Post a message, returning the `ts` Slack assigns it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the API call fails after the single
    /// 429 retry described in `spec.md` §6.
    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String>;

    /// Fetch one page of channel history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the API call fails.
    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage>;
}

/// Live Slack Web API client, backed by `slack-morphism`'s Hyper HTTPS
/// transport.
pub struct SlackService {
    client: SlackClient<SlackClientHyperHttpsConnector>,
    bot_token: SlackApiToken,
}

impl SlackService {
    /// Build a client authenticating with the bot token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the HTTPS connector cannot be created.
    pub fn new(bot_token: &str) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Slack(format!("failed to init https connector: {err}")))?;
        let client = SlackClient::new(connector);
        let token = SlackApiToken {
            token_value: SlackApiTokenValue(bot_token.to_owned()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        Ok(Self {
            client,
            bot_token: token,
        })
    }

    /// Call `auth.test`, per `spec.md` §6's startup check. Fatal on
    /// failure — the caller should exit with the configured auth-failure
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the call fails.
    pub async fn auth_test(&self) -> Result<String> {
        let session = self.client.open_session(&self.bot_token);
        let response = session
            .auth_test()
            .await
            .map_err(|err| AppError::Slack(format!("auth.test failed: {err}")))?;
        Ok(response.user_id.0)
    }

    /// Retry a fallible Slack call once after a 429, sleeping
    /// `max(1, Retry-After)` seconds, per `spec.md` §6.
    async fn with_single_retry<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<
            Output = std::result::Result<T, slack_morphism::errors::SlackClientError>,
        >,
    {
        match call().await {
            Ok(value) => Ok(value),
            Err(slack_morphism::errors::SlackClientError::RateLimitError(rate)) => {
                let delay = rate
                    .retry_after
                    .unwrap_or(Duration::from_secs(1))
                    .max(Duration::from_secs(1));
                warn!(delay_secs = delay.as_secs(), "slack 429; retrying once");
                sleep(delay).await;
                call()
                    .await
                    .map_err(|err| AppError::Slack(format!("slack call failed after retry: {err}")))
            }
            Err(err) => Err(AppError::Slack(format!("slack call failed: {err}"))),
        }
    }
}

#[async_trait::async_trait]
impl SlackPoster for SlackService {
    async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String> {
        let session = self.client.open_session(&self.bot_token);
        let channel = SlackChannelId::new(channel_id.to_owned());
        let thread = thread_ts.map(|ts| SlackTs(ts.to_owned()));

        let response = self
            .with_single_retry(|| {
                let request = SlackApiChatPostMessageRequest {
                    channel: channel.clone(),
                    content: SlackMessageContent::new().with_text(text.to_owned()),
                    as_user: None,
                    icon_emoji: None,
                    icon_url: None,
                    link_names: Some(true),
                    parse: None,
                    thread_ts: thread.clone(),
                    username: None,
                    reply_broadcast: None,
                    unfurl_links: None,
                    unfurl_media: None,
                };
                session.chat_post_message(&request)
            })
            .await?;

        Ok(response.ts.0)
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage> {
        let session = self.client.open_session(&self.bot_token);
        let channel = SlackChannelId::new(channel_id.to_owned());
        let oldest = oldest.map(|ts| SlackTs(ts.to_owned()));
        let cursor = cursor.map(std::string::ToString::to_string);
        let limit_u16 = u16::try_from(limit).unwrap_or(u16::MAX);

        let response = self
            .with_single_retry(|| {
                let request = SlackApiConversationsHistoryRequest {
                    channel: Some(channel.clone()),
                    cursor: cursor.clone().map(Into::into),
                    latest: None,
                    limit: Some(limit_u16),
                    oldest: oldest.clone(),
                    inclusive: None,
                    include_all_metadata: None,
                };
                session.conversations_history(&request)
            })
            .await?;

        Ok(HistoryPage {
            messages: response.messages,
            has_more: response.has_more.unwrap_or(false),
            next_cursor: response
                .response_metadata
                .and_then(|meta| meta.next_cursor)
                .map(|cursor| cursor.0)
                .filter(|cursor| !cursor.is_empty()),
        })
    }
}
