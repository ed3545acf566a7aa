//! Conversation relay for threadline
//!
//! This crate connects a chat channel to the configured backends and keeps
//! the shared thread state in step with every message and reply.

pub mod backends;
pub mod prompt;
pub mod relay;

pub use backends::build_backends;
pub use prompt::PromptBuilder;
pub use relay::{ConversationRelay, RelayThreads, StatelessBackend, BACKEND_FAILURE_NOTICE};
