//! Transcript reconstruction for stateless backends

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::session::SessionIndex;
use super::store::MessageStore;
use super::MessageId;

/// Speaker assigned to a transcript position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn flip(self) -> Self {
        match self {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a rebuilt conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

impl TranscriptEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Walks a chain from its anchor and labels each record by position
pub struct ContextBuilder;

impl ContextBuilder {
    /// Transcript of the conversation whose latest message is `message_id`
    ///
    /// Roles alternate user/assistant starting from the anchor regardless of
    /// who wrote each message. When no session ends at `message_id` the
    /// message alone is returned.
    pub fn build<H: Clone>(
        store: &MessageStore,
        sessions: &SessionIndex<H>,
        message_id: MessageId,
    ) -> Vec<TranscriptEntry> {
        let start_id = match sessions.find_by_end(message_id) {
            Ok(start_id) => start_id,
            Err(e) => {
                warn!("{}, using single-turn context", e);
                message_id
            }
        };

        Self::walk(store, start_id)
    }

    /// Transcript of the chain starting at `start_id`
    pub fn walk(store: &MessageStore, start_id: MessageId) -> Vec<TranscriptEntry> {
        let mut transcript = Vec::new();
        let mut role = Role::User;
        let mut cursor = Some(start_id);

        // A chain can hold at most every stored record; anything longer is a cycle.
        let limit = store.len();

        while let Some(id) = cursor {
            let Some(record) = store.get(id) else {
                break;
            };
            if transcript.len() >= limit {
                warn!("Chain from {} exceeds {} records, stopping walk", start_id, limit);
                break;
            }

            transcript.push(TranscriptEntry::new(role, record.text()));
            role = role.flip();
            cursor = record.next_id;
        }

        transcript
    }
}
