//! Live conversation sessions keyed by their chain anchors

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{MessageId, ThreadError};

/// A live conversation
///
/// `H` is the backend handle type; stateless sessions leave it empty.
#[derive(Debug, Clone)]
pub struct Session<H = ()> {
    /// First message of the chain, never changes
    pub start_id: MessageId,
    /// Latest message of the chain
    pub end_id: MessageId,
    /// Lifecycle ticks since `end_id` last moved
    pub idle_ticks: u64,
    /// Backend conversation object, created lazily by stateful turns
    pub backend_handle: Option<H>,
    /// Session creation time
    pub created_at: DateTime<Utc>,
}

impl<H> Session<H> {
    fn new(id: MessageId, backend_handle: Option<H>) -> Self {
        Self {
            start_id: id,
            end_id: id,
            idle_ticks: 0,
            backend_handle,
            created_at: Utc::now(),
        }
    }
}

/// Result of feeding a (replied-to, new) pair to the index
#[derive(Debug, Clone)]
pub struct Advance<H = ()> {
    /// True when an existing session was continued
    pub extended: bool,
    /// Anchor of the session the new message now belongs to
    pub start_id: MessageId,
    /// Backend handle, only filled by stateful advances
    pub backend_handle: Option<H>,
}

/// Index of live sessions
///
/// Sessions are owned by anchor; a second map from each session's current
/// end id back to its anchor answers "which conversation does a reply to
/// this message continue" without scanning. Because that map is keyed by
/// end id, two live sessions can never share one.
#[derive(Debug)]
pub struct SessionIndex<H = ()> {
    sessions: HashMap<MessageId, Session<H>>,
    by_end: HashMap<MessageId, MessageId>,
}

impl<H> Default for SessionIndex<H> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            by_end: HashMap::new(),
        }
    }
}

impl<H: Clone> SessionIndex<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor of the session whose latest message is `end_id`
    pub fn find_by_end(&self, end_id: MessageId) -> Result<MessageId, ThreadError> {
        self.by_end
            .get(&end_id)
            .copied()
            .ok_or(ThreadError::SessionNotFound(end_id))
    }

    /// Continue the session ending at `end_id` with `new_id`, or open a
    /// fresh session rooted at `new_id` when none does
    pub fn advance(&mut self, end_id: MessageId, new_id: MessageId) -> Advance<H> {
        match self.extend(end_id, new_id) {
            Some(start_id) => Advance {
                extended: true,
                start_id,
                backend_handle: None,
            },
            None => self.open_session(new_id, None),
        }
    }

    /// Like [`advance`](Self::advance), also returning the session's backend
    /// handle, built with `make_handle` the first time one is needed
    pub fn advance_stateful<F>(
        &mut self,
        end_id: MessageId,
        new_id: MessageId,
        make_handle: F,
    ) -> Advance<H>
    where
        F: FnOnce() -> H,
    {
        let Some(start_id) = self.extend(end_id, new_id) else {
            return self.open_session(new_id, Some(make_handle()));
        };

        let handle = self.sessions.get_mut(&start_id).map(|session| {
            session
                .backend_handle
                .get_or_insert_with(make_handle)
                .clone()
        });

        Advance {
            extended: true,
            start_id,
            backend_handle: handle,
        }
    }

    /// Open a session for a message that replies to nothing
    pub fn open(&mut self, id: MessageId) -> Advance<H> {
        self.open_session(id, None)
    }

    /// Open a stateful session for a message that replies to nothing
    pub fn open_stateful(&mut self, id: MessageId, handle: H) -> Advance<H> {
        self.open_session(id, Some(handle))
    }

    /// Age every live session by one tick
    pub fn tick(&mut self) {
        for session in self.sessions.values_mut() {
            session.idle_ticks = session.idle_ticks.saturating_add(1);
        }
    }

    /// Drop every session idle for more than `timeout` ticks, returning
    /// their anchors in ascending order
    pub fn evict_expired(&mut self, timeout: u64) -> Vec<MessageId> {
        let mut expired: Vec<MessageId> = self
            .sessions
            .values()
            .filter(|session| session.idle_ticks > timeout)
            .map(|session| session.start_id)
            .collect();
        expired.sort();

        for start_id in &expired {
            if let Some(session) = self.sessions.remove(start_id) {
                self.by_end.remove(&session.end_id);
                debug!(
                    "Evicted session {} -> {} after {} idle ticks",
                    session.start_id, session.end_id, session.idle_ticks
                );
            }
        }

        expired
    }

    pub fn get(&self, start_id: MessageId) -> Option<&Session<H>> {
        self.sessions.get(&start_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions in ascending anchor order
    pub fn iter(&self) -> impl Iterator<Item = &Session<H>> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.start_id);
        sessions.into_iter()
    }

    /// Move the session ending at `end_id` forward, returning its anchor
    fn extend(&mut self, end_id: MessageId, new_id: MessageId) -> Option<MessageId> {
        let start_id = self.by_end.get(&end_id).copied()?;

        if let Some(&owner) = self.by_end.get(&new_id) {
            warn!(
                "Message {} already ends session {}, not moving session {} onto it",
                new_id, owner, start_id
            );
            return None;
        }

        let Some(session) = self.sessions.get_mut(&start_id) else {
            warn!(
                "End index points {} at missing session {}, dropping entry",
                end_id, start_id
            );
            self.by_end.remove(&end_id);
            return None;
        };

        session.end_id = new_id;
        session.idle_ticks = 0;
        self.by_end.remove(&end_id);
        self.by_end.insert(new_id, start_id);
        Some(start_id)
    }

    fn open_session(&mut self, id: MessageId, handle: Option<H>) -> Advance<H> {
        if let Some(&owner) = self.by_end.get(&id) {
            warn!(
                "Message {} already ends session {}, keeping the existing session",
                id, owner
            );
            let backend_handle = self
                .sessions
                .get(&owner)
                .and_then(|s| s.backend_handle.clone());
            return Advance {
                extended: false,
                start_id: owner,
                backend_handle,
            };
        }

        if let Some(existing) = self.sessions.get(&id) {
            warn!(
                "Message {} already anchors a session ending at {}, keeping it",
                id, existing.end_id
            );
            return Advance {
                extended: false,
                start_id: id,
                backend_handle: existing.backend_handle.clone(),
            };
        }

        debug!("Opened session at {}", id);
        let backend_handle = handle.clone();
        self.sessions.insert(id, Session::new(id, handle));
        self.by_end.insert(id, id);

        Advance {
            extended: false,
            start_id: id,
            backend_handle,
        }
    }
}
