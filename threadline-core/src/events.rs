//! Event types exchanged between the chat channel and the relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::threading::MessageId;

/// Which backend a command explicitly asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Full transcript replayed on every call
    Stateless,
    /// History kept server-side
    Stateful,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Stateless => "stateless",
            BackendKind::Stateful => "stateful",
        }
    }
}

/// Message received from a chat channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel identifier (e.g., "telegram")
    pub channel: String,
    /// Chat identifier
    pub chat_id: String,
    /// Transport-assigned id of this message
    pub message_id: MessageId,
    /// Id of the message this one replies to, if any
    pub reply_to: Option<MessageId>,
    /// Message text content
    pub content: Option<String>,
    /// Backend explicitly requested by a command (`/chat`, `/stateful`)
    pub command: Option<BackendKind>,
    /// Message timestamp
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a new inbound message
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        message_id: MessageId,
        content: Option<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            message_id,
            reply_to: None,
            content,
            command: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the replied-to message id
    pub fn replying_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Mark the message as an explicit backend command
    pub fn with_command(mut self, kind: BackendKind) -> Self {
        self.command = Some(kind);
        self
    }

    /// Text content, empty when absent
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Message to send to a chat channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Channel identifier
    pub channel: String,
    /// Target chat identifier
    pub chat_id: String,
    /// Message text content
    pub content: String,
    /// Message to reply to
    pub reply_to: Option<MessageId>,
}

impl OutboundMessage {
    /// Create a new outbound message
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
        }
    }

    /// Set the reply-to message ID
    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}
