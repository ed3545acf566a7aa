//! Message records and their forward links

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{MessageId, ThreadError};

/// Backend-specific data attached to a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendContext {
    /// Plain message, answered from the replayed transcript
    #[default]
    None,
    /// Produced by a stateful backend; replies continue that conversation
    StatefulRef {
        parent_backend_message_id: String,
        backend_conversation_id: String,
    },
}

impl BackendContext {
    pub fn stateful(
        parent_backend_message_id: impl Into<String>,
        backend_conversation_id: impl Into<String>,
    ) -> Self {
        BackendContext::StatefulRef {
            parent_backend_message_id: parent_backend_message_id.into(),
            backend_conversation_id: backend_conversation_id.into(),
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, BackendContext::StatefulRef { .. })
    }
}

/// One message in a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Next message in the same thread, `None` at the tip
    pub next_id: Option<MessageId>,
    pub content: Option<String>,
    pub backend_context: BackendContext,
}

impl MessageRecord {
    /// Content with absent text read as empty
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Id-keyed arena of message records
///
/// Records reference each other only through `next_id`, so removing one is
/// a plain map erase.
#[derive(Debug, Default)]
pub struct MessageStore {
    records: HashMap<MessageId, MessageRecord>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new tip record
    pub fn append(
        &mut self,
        id: MessageId,
        content: Option<String>,
        backend_context: BackendContext,
    ) -> Result<(), ThreadError> {
        if self.records.contains_key(&id) {
            return Err(ThreadError::DuplicateId(id));
        }

        self.records.insert(
            id,
            MessageRecord {
                id,
                next_id: None,
                content,
                backend_context,
            },
        );
        Ok(())
    }

    /// Point `parent_id` forward at `child_id`
    ///
    /// Returns false when the parent is unknown (the child starts a new
    /// thread) or already continued by another message; an existing link is
    /// never overwritten.
    pub fn link(&mut self, parent_id: MessageId, child_id: MessageId) -> bool {
        let Some(parent) = self.records.get_mut(&parent_id) else {
            debug!("Link target {} not stored, {} starts a thread", parent_id, child_id);
            return false;
        };

        match parent.next_id {
            Some(existing) if existing == child_id => true,
            Some(existing) => {
                warn!(
                    "Message {} already continues to {}, refusing link to {}",
                    parent_id, existing, child_id
                );
                false
            }
            None => {
                parent.next_id = Some(child_id);
                true
            }
        }
    }

    /// Delete a record, returning where its chain continued
    pub fn remove(&mut self, id: MessageId) -> Option<MessageId> {
        self.records.remove(&id).and_then(|record| record.next_id)
    }

    /// Delete every record reachable from `start_id`, returning how many went
    pub fn remove_chain(&mut self, start_id: MessageId) -> usize {
        let mut removed = 0;
        let mut cursor = Some(start_id);

        while let Some(id) = cursor {
            if !self.records.contains_key(&id) {
                break;
            }
            cursor = self.remove(id);
            removed += 1;
        }

        removed
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending id order
    pub fn records(&self) -> Vec<&MessageRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}
