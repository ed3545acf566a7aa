//! Base trait for channel handlers

use async_trait::async_trait;
use std::sync::Arc;
use threadline_core::events::{InboundMessage, OutboundMessage};
use threadline_core::MessageId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Trait for channel handlers
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    /// Deliver a message and return the id the platform assigned to it
    async fn send(&self, message: OutboundMessage) -> Result<MessageId>;

    /// Show a typing indicator in `chat_id` until the next `send` there
    async fn start_typing(&self, _chat_id: &str) {}

    /// Set the inbound message sender
    fn set_inbound_sender(&mut self, tx: mpsc::Sender<InboundMessage>);

    /// Check if a chat may talk to the bot
    fn is_allowed(&self, chat_id: &str) -> bool;
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel error: {0}")]
    Error(String),

    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Channel not running: {0}")]
    NotRunning(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("API error: {0}")]
    ApiError(String),

    /// The inbound queue is closed
    #[error("Send error: {0}")]
    SendError(String),

    /// Delivery failed even as plain text
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Access denied for chat: {0}")]
    AccessDenied(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Chats a channel answers in; empty means every chat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    chat_ids: Vec<i64>,
}

impl AllowList {
    pub fn new(chat_ids: Vec<i64>) -> Self {
        Self { chat_ids }
    }

    pub fn is_allowed(&self, chat_id: i64) -> bool {
        self.chat_ids.is_empty() || self.chat_ids.contains(&chat_id)
    }

    /// String form used by [`ChannelHandler::is_allowed`]; unparsable ids
    /// are only allowed when the list is empty
    pub fn is_allowed_str(&self, chat_id: &str) -> bool {
        match chat_id.trim().parse::<i64>() {
            Ok(id) => self.is_allowed(id),
            Err(_) => self.chat_ids.is_empty(),
        }
    }
}

/// Inbound side shared by a channel and its dispatcher tasks
#[derive(Debug, Clone)]
pub struct BaseChannel {
    pub name: String,
    pub allow_list: AllowList,
    pub inbound_tx: Option<mpsc::Sender<InboundMessage>>,
}

impl BaseChannel {
    pub fn new(name: impl Into<String>, allow_list: AllowList) -> Self {
        Self {
            name: name.into(),
            allow_list,
            inbound_tx: None,
        }
    }

    pub fn set_inbound_sender(&mut self, tx: mpsc::Sender<InboundMessage>) {
        self.inbound_tx = Some(tx);
    }

    /// Check access and forward a message to the relay
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<()> {
        if !self.allow_list.is_allowed_str(&msg.chat_id) {
            warn!(
                "Access denied for chat {} on channel {}. Add it to telegram.allowed_chat_ids to grant access.",
                msg.chat_id, self.name
            );
            return Err(ChannelError::AccessDenied(msg.chat_id));
        }

        match &self.inbound_tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|e| ChannelError::SendError(e.to_string())),
            None => {
                debug!("No inbound sender on channel {}, dropping message", self.name);
                Ok(())
            }
        }
    }
}

/// Shared channel handler type
pub type ChannelHandlerPtr = Arc<RwLock<dyn ChannelHandler>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_empty_allows_all() {
        let allow = AllowList::default();
        assert!(allow.is_allowed(1));
        assert!(allow.is_allowed(-100123));
        assert!(allow.is_allowed_str("not-a-number"));
    }

    #[test]
    fn test_allow_list_with_ids() {
        let allow = AllowList::new(vec![42, -1001]);
        assert!(allow.is_allowed(42));
        assert!(allow.is_allowed_str("-1001"));
        assert!(!allow.is_allowed(7));
        assert!(!allow.is_allowed_str("abc"));
    }

    #[tokio::test]
    async fn test_handle_message_forwards_allowed() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut base = BaseChannel::new("telegram", AllowList::new(vec![42]));
        base.set_inbound_sender(tx);

        base.handle_message(InboundMessage::new("telegram", "42", MessageId::new(42, 1), Some("hi".into())))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message_id, MessageId::new(42, 1));
    }

    #[tokio::test]
    async fn test_handle_message_rejects_unknown_chat() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut base = BaseChannel::new("telegram", AllowList::new(vec![42]));
        base.set_inbound_sender(tx);

        let err = base
            .handle_message(InboundMessage::new("telegram", "7", MessageId::new(7, 1), None))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::AccessDenied(ref id) if id == "7"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::NotConfigured("test".to_string());
        assert_eq!(err.to_string(), "Channel not configured: test");
    }
}
