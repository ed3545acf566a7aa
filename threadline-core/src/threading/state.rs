//! Message store and session index behind one lock

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::context::{ContextBuilder, TranscriptEntry};
use super::session::{Advance, SessionIndex};
use super::store::{BackendContext, MessageStore};
use super::{MessageId, ThreadError};
use crate::utils::truncate;

/// Thread state shared between the relay and the lifecycle manager
///
/// Never hold the guard across an `.await`.
pub type SharedThreads<H = ()> = Arc<Mutex<ThreadState<H>>>;

/// Where a reply to a stored message must be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Replay the transcript to the stateless backend
    Stateless,
    /// Continue a server-side conversation
    Stateful {
        parent_message_id: String,
        conversation_id: String,
    },
}

/// A stateful advance together with what the parent record carried
#[derive(Debug, Clone)]
pub struct StatefulAdvance<H> {
    pub advance: Advance<H>,
    /// Backend context of the replied-to record, `None` if there was none
    pub parent_context: BackendContext,
}

/// A session removed by the lifecycle tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub start_id: MessageId,
    /// Records deleted from the chain
    pub removed: usize,
}

/// Point-in-time view used for debug dumps and status output
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub sessions: Vec<SessionSummary>,
    pub records: Vec<RecordSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub start_id: MessageId,
    pub end_id: MessageId,
    pub idle_ticks: u64,
    pub stateful: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: MessageId,
    pub next_id: Option<MessageId>,
    pub preview: String,
}

/// Owner of the message store and session index
#[derive(Debug)]
pub struct ThreadState<H = ()> {
    store: MessageStore,
    sessions: SessionIndex<H>,
}

impl<H> Default for ThreadState<H> {
    fn default() -> Self {
        Self {
            store: MessageStore::default(),
            sessions: SessionIndex::default(),
        }
    }
}

impl<H: Clone> ThreadState<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty state wrapped for sharing
    pub fn shared() -> SharedThreads<H> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionIndex<H> {
        &self.sessions
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty() && self.sessions.is_empty()
    }

    /// Store a message and thread it onto the conversation it replies to
    ///
    /// The parent is only linked forward when its session was actually
    /// continued, so every live chain runs exactly from a session's anchor
    /// to its end.
    pub fn record_message(
        &mut self,
        id: MessageId,
        reply_to: Option<MessageId>,
        content: Option<String>,
        backend_context: BackendContext,
    ) -> Result<Advance<H>, ThreadError> {
        self.store.append(id, content, backend_context)?;

        let advance = match reply_to {
            Some(parent) => self.sessions.advance(parent, id),
            None => self.sessions.open(id),
        };

        if advance.extended {
            if let Some(parent) = reply_to {
                self.store.link(parent, id);
            }
        }

        debug!(
            "Recorded {} in session {} (extended: {})",
            id, advance.start_id, advance.extended
        );
        Ok(advance)
    }

    /// Stateful variant of [`record_message`](Self::record_message)
    ///
    /// Also returns the session's backend handle and the replied-to
    /// record's backend context, which is all a stateful backend needs.
    pub fn record_stateful_message<F>(
        &mut self,
        id: MessageId,
        reply_to: Option<MessageId>,
        content: Option<String>,
        backend_context: BackendContext,
        make_handle: F,
    ) -> Result<StatefulAdvance<H>, ThreadError>
    where
        F: FnOnce() -> H,
    {
        self.store.append(id, content, backend_context)?;

        let (advance, parent_context) = match reply_to {
            Some(parent) => {
                let parent_context = self
                    .store
                    .get(parent)
                    .map(|record| record.backend_context.clone())
                    .unwrap_or_default();
                let advance = self.sessions.advance_stateful(parent, id, make_handle);
                if advance.extended {
                    self.store.link(parent, id);
                }
                (advance, parent_context)
            }
            None => (
                self.sessions.open_stateful(id, make_handle()),
                BackendContext::None,
            ),
        };

        debug!(
            "Recorded stateful {} in session {} (extended: {})",
            id, advance.start_id, advance.extended
        );
        Ok(StatefulAdvance {
            advance,
            parent_context,
        })
    }

    /// Backend route for a reply to `reply_to`, `None` if it is not stored
    pub fn route_for_reply(&self, reply_to: MessageId) -> Option<Route> {
        let record = self.store.get(reply_to)?;
        Some(match &record.backend_context {
            BackendContext::None => Route::Stateless,
            BackendContext::StatefulRef {
                parent_backend_message_id,
                backend_conversation_id,
            } => Route::Stateful {
                parent_message_id: parent_backend_message_id.clone(),
                conversation_id: backend_conversation_id.clone(),
            },
        })
    }

    /// Transcript ending at `message_id`
    pub fn transcript(&self, message_id: MessageId) -> Vec<TranscriptEntry> {
        ContextBuilder::build(&self.store, &self.sessions, message_id)
    }

    /// One lifecycle step: age sessions, then drop expired ones with their chains
    pub fn tick_and_evict(&mut self, timeout: u64) -> Vec<Eviction> {
        self.sessions.tick();

        self.sessions
            .evict_expired(timeout)
            .into_iter()
            .map(|start_id| {
                let removed = self.store.remove_chain(start_id);
                info!(
                    "Session {} expired, removed {} message(s)",
                    start_id, removed
                );
                Eviction { start_id, removed }
            })
            .collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            sessions: self
                .sessions
                .iter()
                .map(|s| SessionSummary {
                    start_id: s.start_id,
                    end_id: s.end_id,
                    idle_ticks: s.idle_ticks,
                    stateful: s.backend_handle.is_some(),
                    created_at: s.created_at,
                })
                .collect(),
            records: self
                .store
                .records()
                .into_iter()
                .map(|r| RecordSummary {
                    id: r.id,
                    next_id: r.next_id,
                    preview: truncate(r.text(), 40),
                })
                .collect(),
        }
    }
}
