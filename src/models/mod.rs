//! Domain types shared across the state store, decider, executor, and
//! orchestrator.

pub mod approval;
pub mod message;
pub mod session;
pub mod task;

pub use approval::{ApprovalRecord, ApprovalStatus};
pub use message::{EventBatch, SlackFile, SlackMessage, SlackReaction};
pub use session::AgentSession;
pub use task::{Task, TaskPayload, TaskStatus};
