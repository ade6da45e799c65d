//! Socket Mode listener: a background WebSocket task feeds normalized
//! events into an internal channel; `receive` just drains it.
//!
//! Event registration uses `SlackClientSocketModeListener` +
//! `SlackSocketModeListenerCallbacks`, wired for channel messages and
//! reaction-added events rather than chat commands/interactions.

use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::{
    SlackApiToken, SlackApiTokenType, SlackApiTokenValue, SlackClient,
    SlackClientEventsListenerEnvironment, SlackClientEventsUserState,
    SlackClientHyperHttpsConnector, SlackClientSocketModeConfig, SlackClientSocketModeListener,
    SlackEventCallbackBody, SlackMessageEvent, SlackPushEventCallback,
    SlackReactionAddedEvent, SlackReactionsItem, SlackSocketModeListenerCallbacks,
    UserCallbackResult,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::models::{EventBatch, SlackMessage as NormalizedMessage, SlackReaction};
use crate::{AppError, Result};

use super::Listener;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Event bridged from a Socket Mode callback into the pull-based listener.
enum RawEvent {
    Message(NormalizedMessage),
    Reaction(SlackReaction),
}

struct CallbackState {
    sender: mpsc::Sender<RawEvent>,
    command_channel_id: String,
}

fn normalize_message_event(command_channel_id: &str, event: &SlackMessageEvent) -> Option<NormalizedMessage> {
    if event.subtype.is_some() {
        return None;
    }
    let channel_id = event.origin.channel.as_ref().map(|c| c.0.clone())?;
    if channel_id != command_channel_id {
        return None;
    }
    let ts = event.origin.ts.0.clone();
    if ts.is_empty() {
        return None;
    }
    let user = event
        .sender
        .user
        .as_ref()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_owned());

    Some(NormalizedMessage {
        channel_id,
        ts,
        thread_ts: event.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
        user,
        text: event
            .content
            .as_ref()
            .and_then(|content| content.text.clone())
            .unwrap_or_default(),
        subtype: String::new(),
        files: Vec::new(),
    })
}

fn normalize_reaction_event(
    command_channel_id: &str,
    event: &SlackReactionAddedEvent,
) -> Option<SlackReaction> {
    let SlackReactionsItem::Message(history) = &event.item else {
        return None;
    };
    let channel = history.origin.channel.as_ref()?;
    let ts = &history.origin.ts;
    if channel.0 != command_channel_id {
        return None;
    }

    Some(SlackReaction {
        channel_id: channel.0.clone(),
        message_ts: ts.0.clone(),
        reaction: event.reaction.0.trim_matches(':').to_owned(),
        user: event.user.0.clone(),
    })
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let guard = states.read().await;
    let Some(state) = guard.get_user_state::<Arc<CallbackState>>() else {
        return Ok(());
    };

    let raw = match event.event {
        SlackEventCallbackBody::Message(msg) => {
            normalize_message_event(&state.command_channel_id, &msg).map(RawEvent::Message)
        }
        SlackEventCallbackBody::ReactionAdded(reaction) => {
            normalize_reaction_event(&state.command_channel_id, &reaction).map(RawEvent::Reaction)
        }
        _ => None,
    };

    if let Some(event) = raw {
        if state.sender.send(event).await.is_err() {
            warn!("socket event queue closed; dropping event");
        }
    }

    Ok(())
}

/// Socket Mode listener, own `SlackClient` for both bot and app tokens.
pub struct SocketListener {
    receiver: mpsc::Receiver<RawEvent>,
    _listener: tokio::task::JoinHandle<()>,
}

impl SocketListener {
    /// Start the background Socket Mode task and return a pull-based
    /// listener over it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` if the HTTPS connector cannot be built.
    pub fn start(bot_token: &str, app_token: &str, command_channel_id: String) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new().map_err(|err| {
            AppError::Listener(format!("failed to init https connector: {err}"))
        })?;
        let client = Arc::new(SlackClient::new(connector));
        let bot = SlackApiToken {
            token_value: SlackApiTokenValue(bot_token.to_owned()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let app = SlackApiToken {
            token_value: SlackApiTokenValue(app_token.to_owned()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::App),
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let state = Arc::new(CallbackState {
            sender: tx,
            command_channel_id,
        });

        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(&client))
                .with_error_handler(|err, _client, _states| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                })
                .with_user_state(state),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);
        let config = SlackClientSocketModeConfig {
            max_connections_count: SlackClientSocketModeConfig::DEFAULT_CONNECTIONS_COUNT,
            debug_connections: SlackClientSocketModeConfig::DEFAULT_DEBUG_CONNECTIONS,
            initial_backoff_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_INITIAL_BACKOFF_IN_SECONDS,
            reconnect_timeout_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_RECONNECT_TIMEOUT_IN_SECONDS,
            ping_interval_in_seconds: SlackClientSocketModeConfig::DEFAULT_PING_INTERVAL_IN_SECONDS,
            ping_failure_threshold_times:
                SlackClientSocketModeConfig::DEFAULT_PING_FAILURE_THRESHOLD_TIMES,
        };
        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);
        let app_token_owned = app;

        let handle = tokio::spawn(async move {
            if let Err(err) = listener.listen_for(&app_token_owned).await {
                error!(?err, "socket mode listen failed");
                return;
            }
            listener.serve().await;
            info!("socket mode listener exited");
        });

        Ok(Self {
            receiver: rx,
            _listener: handle,
        })
    }
}

#[async_trait::async_trait]
impl Listener for SocketListener {
    async fn receive(&mut self, timeout: Duration) -> Result<EventBatch> {
        let mut batch = EventBatch::default();

        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => push(&mut batch, event),
            Ok(None) => {
                return Err(AppError::Listener(
                    "socket mode event channel closed".to_owned(),
                ))
            }
            Err(_) => return Ok(batch),
        }

        while let Ok(event) = self.receiver.try_recv() {
            push(&mut batch, event);
        }

        Ok(batch)
    }
}

fn push(batch: &mut EventBatch, event: RawEvent) {
    match event {
        RawEvent::Message(message) => batch.messages.push(message),
        RawEvent::Reaction(reaction) => batch.reactions.push(reaction),
    }
}
