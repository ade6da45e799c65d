//! Command-channel ingestion, abstracted behind a single capability so the
//! orchestrator never knows whether it is polling or streaming.
//!
//! Per `spec.md` §9 Design Note 2, both ingestion strategies are modeled as
//! one blocking-receive call: poll mode performs its own pagination inside
//! `receive` and always returns `reactions: []`; socket mode drains events
//! accumulated by a background WebSocket task.

use std::time::Duration;

use crate::models::EventBatch;
use crate::Result;

pub mod poll;
pub mod socket;

pub use poll::PollListener;
pub use socket::SocketListener;

/// A source of normalized Slack events.
#[async_trait::async_trait]
pub trait Listener: Send {
    /// Block for up to `timeout` and return whatever messages/reactions
    /// became available. An empty batch on timeout is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` if the underlying transport fails.
    async fn receive(&mut self, timeout: Duration) -> Result<EventBatch>;
}
