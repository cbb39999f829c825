//! Chat session synchronization core.
//!
//! One session owns the in-memory view of the active conversation and keeps
//! it in step with the persisted store and the completion service. The
//! reducer lives in [`state`]; [`worker`] runs its effects on tokio.

pub mod context;
pub mod state;
mod worker;

use serde::Serialize;

pub use context::{Capability, SessionContext, User};
pub use state::{Phase, SessionConfig, SessionSnapshot, SessionState};
pub use worker::{spawn_session, SendOutcome, SessionError, SessionHandle};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A first send saved the draft under this id; hosts usually route to it.
    ConversationCreated(String),
}
