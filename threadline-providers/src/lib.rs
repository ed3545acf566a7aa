//! Backend integrations for threadline
//!
//! Two kinds of backend are supported: stateless chat-completion providers
//! that receive the full transcript on every call, and stateful
//! conversation backends addressed by server-side ids.

pub mod base;
pub mod openai;
pub mod stateful;

pub use base::{LLMProvider, LLMResponse, Message, ProviderError, ProviderResult};
pub use openai::ChatCompletionClient;
pub use stateful::{
    clean_reply, ConversationClient, ConversationHandle, StatefulConversation, StatefulProvider,
    StatefulReply, StatefulRequest,
};
