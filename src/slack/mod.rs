//! Slack Web API bridge layer: plain-text message formatting plus the
//! thin `chat.postMessage` / `conversations.history` client used by the
//! approval manager, reporter, and poll-mode listener.

pub mod blocks;
pub mod client;

pub use client::{HistoryPage, SlackPoster, SlackService};
