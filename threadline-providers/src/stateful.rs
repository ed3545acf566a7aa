//! Conversation backends that keep history on the server
//!
//! Instead of replaying a transcript, a stateful backend is addressed with
//! the id of the message being replied to and the id of its conversation.
//! Each thread owns one [`ConversationHandle`], opened lazily when the
//! thread starts.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::base::{ProviderError, ProviderResult};

/// Citation markers like `[^1^]` the backend sprinkles into its answers
static CITATION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\[\^\d+\^\]\s*").expect("valid citation regex"));

/// One turn sent to a stateful backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulRequest {
    #[serde(rename = "message")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl StatefulRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Continue from a previous reply
    pub fn continuing(mut self, parent_message_id: String, conversation_id: String) -> Self {
        self.parent_message_id = Some(parent_message_id);
        self.conversation_id = Some(conversation_id);
        self
    }
}

/// The backend's answer together with the ids that address it later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulReply {
    pub text: String,
    pub message_id: String,
    pub conversation_id: String,
}

/// A single server-side conversation
#[async_trait]
pub trait StatefulConversation: Send + Sync {
    async fn send(&self, request: StatefulRequest) -> ProviderResult<StatefulReply>;
}

pub type ConversationHandle = Arc<dyn StatefulConversation>;

/// Factory for conversation handles
pub trait StatefulProvider: Send + Sync {
    fn open_conversation(&self) -> ConversationHandle;
}

/// Strip citation markers, collapsing the whitespace around them
pub fn clean_reply(text: &str) -> String {
    CITATION_MARKER.replace_all(text, "").into_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    response: String,
    message_id: String,
    conversation_id: String,
}

#[derive(Debug)]
struct ClientInner {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    extra_headers: HashMap<String, String>,
}

/// HTTP client for `POST {api_base}/conversation` servers
#[derive(Debug, Clone)]
pub struct ConversationClient {
    inner: Arc<ClientInner>,
}

impl ConversationClient {
    pub fn new(
        api_key: Option<String>,
        api_base: impl Into<String>,
        extra_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                client: Client::builder()
                    .http1_only()
                    .build()
                    .unwrap_or_else(|_| Client::new()),
                api_base: api_base.into().trim_end_matches('/').to_string(),
                api_key: api_key.filter(|key| !key.trim().is_empty()),
                extra_headers,
            }),
        }
    }
}

impl StatefulProvider for ConversationClient {
    fn open_conversation(&self) -> ConversationHandle {
        Arc::new(HttpConversation {
            inner: Arc::clone(&self.inner),
            conversation_id: Mutex::new(None),
        })
    }
}

/// Conversation handle backed by [`ConversationClient`]
///
/// Remembers the conversation id the server assigned so that later turns
/// without explicit ids stay in the same conversation.
struct HttpConversation {
    inner: Arc<ClientInner>,
    conversation_id: Mutex<Option<String>>,
}

#[async_trait]
impl StatefulConversation for HttpConversation {
    async fn send(&self, mut request: StatefulRequest) -> ProviderResult<StatefulReply> {
        if request.conversation_id.is_none() {
            request.conversation_id = self.conversation_id.lock().clone();
        }

        let url = format!("{}/conversation", self.inner.api_base);
        debug!(
            "Sending conversation turn to {} (parent: {:?})",
            url, request.parent_message_id
        );

        let mut req_builder = self.inner.client.post(&url).json(&request);
        if let Some(api_key) = &self.inner.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }
        for (key, value) in &self.inner.extra_headers {
            req_builder = req_builder.header(key, value);
        }

        let response = req_builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::ApiError(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let data: ConversationResponse = response.json().await?;
        *self.conversation_id.lock() = Some(data.conversation_id.clone());

        Ok(StatefulReply {
            text: clean_reply(&data.response),
            message_id: data.message_id,
            conversation_id: data.conversation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_clean_reply_strips_citations() {
        assert_eq!(
            clean_reply("Rust is fast [^1^] and safe [^12^]."),
            "Rust is fastand safe."
        );
        assert_eq!(clean_reply("no markers"), "no markers");
        assert_eq!(clean_reply("[^3^]"), "");
    }

    #[test]
    fn test_request_wire_shape() {
        let first = serde_json::to_value(StatefulRequest::new("hi")).unwrap();
        assert_eq!(first, serde_json::json!({"message": "hi"}));

        let next = StatefulRequest::new("more").continuing("m1".into(), "c1".into());
        assert_eq!(
            serde_json::to_value(next).unwrap(),
            serde_json::json!({"message": "more", "parentMessageId": "m1", "conversationId": "c1"})
        );
    }

    #[tokio::test]
    async fn test_conversation_remembers_server_id() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/conversation")
            .match_body(Matcher::Json(serde_json::json!({"message": "hi"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":"hello [^1^]","messageId":"m1","conversationId":"c1"}"#)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/conversation")
            .match_body(Matcher::Json(
                serde_json::json!({"message": "again", "conversationId": "c1"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":"sure","messageId":"m2","conversationId":"c1"}"#)
            .create_async()
            .await;

        let client = ConversationClient::new(None, server.url(), HashMap::new());
        let conversation = client.open_conversation();

        let reply = conversation.send(StatefulRequest::new("hi")).await.unwrap();
        assert_eq!(
            reply,
            StatefulReply {
                text: "hello".to_string(),
                message_id: "m1".to_string(),
                conversation_id: "c1".to_string(),
            }
        );

        let reply = conversation.send(StatefulRequest::new("again")).await.unwrap();
        assert_eq!(reply.message_id, "m2");

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/conversation")
            .with_status(503)
            .create_async()
            .await;

        let client = ConversationClient::new(Some("key".into()), server.url(), HashMap::new());
        let err = client
            .open_conversation()
            .send(StatefulRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ApiError(_)));
    }
}
