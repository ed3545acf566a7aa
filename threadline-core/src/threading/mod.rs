//! Reply-chain threading engine
//!
//! A conversation is a chain of message records linked forward by id
//! (`store`), tracked by a session that knows the chain's first and last
//! message (`session`). The context builder walks a chain back into an
//! alternating user/assistant transcript (`context`), and `state` bundles
//! the two structures behind the single lock shared with the lifecycle
//! manager.

pub mod context;
pub mod session;
pub mod state;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use context::{ContextBuilder, Role, TranscriptEntry};
pub use session::{Advance, Session, SessionIndex};
pub use state::{Eviction, Route, SharedThreads, StatefulAdvance, StateSnapshot, ThreadState};
pub use store::{BackendContext, MessageRecord, MessageStore};

/// Transport-assigned message identifier, scoped to its chat
///
/// Telegram numbers messages per chat, so the same number in two chats
/// names two different messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub chat: i64,
    pub message: i64,
}

impl MessageId {
    pub fn new(chat: i64, message: i64) -> Self {
        Self { chat, message }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat, self.message)
    }
}

/// Errors raised by the threading engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// The transport delivered the same id twice
    #[error("duplicate message id {0}")]
    DuplicateId(MessageId),

    /// No live session ends at this id
    #[error("no session ends at message {0}")]
    SessionNotFound(MessageId),
}
