//! The session store: every live session, by id.
//!
//! # Concurrency note
//!
//! `SessionStore` is not thread-safe by itself. The server wraps it in a
//! `tokio::sync::Mutex` and holds the lock for the whole of any
//! multi-step change (resume, destroy), so no one observes a session
//! half-rebound.

use std::collections::HashMap;

use tracing::info;

use crate::{ClientLink, Session, SessionError, SessionId};

/// Registry of sessions, keyed by [`SessionId`].
///
/// ```text
/// create() ──→ [Active] ──unbind──→ [Idle] ──bind──→ [Active]
///                  │                   │
///                  └──────remove()─────┴──→ [Closed]
/// ```
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session bound to `client` under a fresh random id.
    pub fn create(&mut self, client: ClientLink) -> &mut Session {
        let mut id = SessionId::generate();
        while self.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        info!(session = %id, client = %client.id(), "session created");
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id, client))
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Like [`get_mut`](Self::get_mut), as a `Result`.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session does not exist.
    pub fn require(&mut self, id: &SessionId) -> Result<&mut Session, SessionError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Removes a session and marks it closed for anyone watching its
    /// status.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(id)?;
        session.mark_closed();
        info!(session = %id, "session removed");
        Some(session)
    }

    /// Sessions with no bound client.
    pub fn idle_ids(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_idle())
            .map(|s| s.id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tether_protocol::ConnectionId;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{Outgoing, SessionStatus};

    fn link(id: u64) -> (ClientLink, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientLink::new(ConnectionId::new(id), tx), rx)
    }

    #[test]
    fn test_create_and_get() {
        let mut store = SessionStore::new();
        let (l, _rx) = link(1);
        let id = store.create(l).id().clone();

        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
        assert!(store.get(&id).unwrap().is_bound_to(ConnectionId::new(1)));
    }

    #[test]
    fn test_each_create_gets_a_new_id() {
        let mut store = SessionStore::new();
        let (l1, _rx1) = link(1);
        let (l2, _rx2) = link(2);
        let a = store.create(l1).id().clone();
        let b = store.create(l2).id().clone();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_marks_session_closed() {
        let mut store = SessionStore::new();
        let (l, _rx) = link(1);
        let session = store.create(l);
        let id = session.id().clone();
        let status = session.subscribe();

        let removed = store.remove(&id).expect("present");
        assert_eq!(removed.status(), SessionStatus::Closed);
        assert_eq!(*status.borrow(), SessionStatus::Closed);
        assert!(store.remove(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_require_missing_session() {
        let mut store = SessionStore::new();
        let err = store.require(&SessionId::from("nope")).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn test_idle_ids_lists_orphaned_sessions() {
        let mut store = SessionStore::new();
        let (l1, _rx1) = link(1);
        let (l2, _rx2) = link(2);
        let a = store.create(l1).id().clone();
        store.create(l2);

        store.get_mut(&a).unwrap().unbind(ConnectionId::new(1));
        assert_eq!(store.idle_ids(), vec![a.clone()]);
        assert!(!store.get(&a).unwrap().is_bound_to(ConnectionId::new(1)));
    }
}
