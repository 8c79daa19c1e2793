//! Session types: the durable side of a conversation.
//!
//! A "session" outlives any single socket. It tracks:
//! - WHO it is (`SessionId`, stable across reconnects)
//! - WHAT has been exchanged (inbound/outbound counters and the outbox)
//! - WHERE to send right now (the bound [`ClientLink`], if any)
//! - per-service identities established by `authorize`

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tether_protocol::{ConnectionId, JsonCodec};
use tether_timeout::TimeoutRegistry;
use tokio::sync::{mpsc, watch};

use crate::{OutboxMessage, SessionError};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Stable identifier for a session. 32 lowercase hex characters
/// (128 random bits), so it cannot be guessed to hijack a resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Timing knobs for sessions and the connections bound to them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an orphaned session waits for a resume before it is
    /// destroyed. Default: 30 seconds.
    pub closed_session_grace: Duration,

    /// After this long without anything sent to a client, the server
    /// pushes a bare `sync` frame. Default: 5 seconds.
    pub idle_output_interval: Duration,

    /// A client that sends nothing for this long is closed with the
    /// client-timeout code. Default: 30 seconds.
    pub inbound_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            closed_session_grace: Duration::from_secs(30),
            idle_output_interval: Duration::from_secs(5),
            inbound_idle_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Observable lifecycle of a session.
///
/// ```text
///   Active ──(client lost)──→ Idle ──(grace elapsed)──→ Closed
///     ↑                        │
///     └───────(resume)─────────┘
/// ```
///
/// `Active → Closed` happens directly on a terminal close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// A live client is bound.
    Active,
    /// No client is bound; the session is waiting to be resumed.
    Idle,
    /// The session was destroyed.
    Closed,
}

// ---------------------------------------------------------------------------
// ClientLink
// ---------------------------------------------------------------------------

/// Something queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// An encoded frame.
    Frame(Vec<u8>),
    /// Close the socket with this code and reason.
    Close { code: u16, reason: String },
}

/// The sending half of a live connection, as seen by a session.
///
/// Frames are handed to the connection's writer task over an unbounded
/// channel; the socket write itself happens there. Every successful
/// hand-off refreshes the connection's idle-output timer.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outgoing>,
    idle_output: Option<TimeoutRegistry<ConnectionId, ()>>,
}

impl ClientLink {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id,
            tx,
            idle_output: None,
        }
    }

    /// Refresh `registry[id]` on every frame handed to the writer.
    pub fn with_idle_output(mut self, registry: TimeoutRegistry<ConnectionId, ()>) -> Self {
        self.idle_output = Some(registry);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an encoded frame for the writer task.
    ///
    /// # Errors
    /// [`SessionError::LinkClosed`] if the writer task is gone.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| SessionError::LinkClosed(self.id))?;
        if let Some(idle_output) = &self.idle_output {
            idle_output.add(self.id, ());
        }
        Ok(())
    }

    /// Asks the writer task to close the socket.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), SessionError> {
        self.tx
            .send(Outgoing::Close {
                code,
                reason: reason.to_owned(),
            })
            .map_err(|_| SessionError::LinkClosed(self.id))
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One logical conversation.
///
/// Invariants kept by the methods in this crate:
/// - `outbox` ids are strictly ascending and the last one equals
///   `server_message_id`.
/// - Every id in `outbox` is greater than the last ack received.
/// - `last_sent_message_id <= server_message_id`.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    /// Last inbound message id processed.
    pub(crate) client_message_id: u64,
    /// Last outbound message id issued.
    pub(crate) server_message_id: u64,
    /// Highest outbound id actually handed to a live client.
    pub(crate) last_sent_message_id: u64,
    pub(crate) outbox: VecDeque<OutboxMessage>,
    pub(crate) client: Option<ClientLink>,
    identities: HashMap<String, String>,
    status: watch::Sender<SessionStatus>,
    pub(crate) codec: JsonCodec,
}

impl Session {
    /// Creates a session bound to `client`.
    pub fn new(id: SessionId, client: ClientLink) -> Self {
        let (status, _) = watch::channel(SessionStatus::Active);
        Self {
            id,
            client_message_id: 0,
            server_message_id: 0,
            last_sent_message_id: 0,
            outbox: VecDeque::new(),
            client: Some(client),
            identities: HashMap::new(),
            status,
            codec: JsonCodec,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn client_message_id(&self) -> u64 {
        self.client_message_id
    }

    pub fn server_message_id(&self) -> u64 {
        self.server_message_id
    }

    pub fn last_sent_message_id(&self) -> u64 {
        self.last_sent_message_id
    }

    /// Ids currently waiting for acknowledgment, oldest first.
    pub fn outbox_ids(&self) -> Vec<u64> {
        self.outbox.iter().map(|m| m.id).collect()
    }

    pub fn outbox(&self) -> impl Iterator<Item = &OutboxMessage> {
        self.outbox.iter()
    }

    /// The currently bound client, if any.
    pub fn client(&self) -> Option<&ClientLink> {
        self.client.as_ref()
    }

    pub fn is_bound_to(&self, client: ConnectionId) -> bool {
        self.client.as_ref().is_some_and(|c| c.id() == client)
    }

    /// `true` while no client is bound (waiting for resume or expiry).
    pub fn is_idle(&self) -> bool {
        self.client.is_none()
    }

    /// Binds a new client, returning the one it replaces.
    pub fn bind(&mut self, client: ClientLink) -> Option<ClientLink> {
        let previous = self.client.replace(client);
        self.status.send_replace(SessionStatus::Active);
        previous
    }

    /// Unbinds `client` if it is the one currently bound.
    ///
    /// Returns `false` (and changes nothing) when a newer client has
    /// already taken over the session.
    pub fn unbind(&mut self, client: ConnectionId) -> bool {
        if !self.is_bound_to(client) {
            return false;
        }
        self.client = None;
        self.status.send_replace(SessionStatus::Idle);
        true
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.client = None;
        self.status.send_replace(SessionStatus::Closed);
    }

    /// Records the identity a service authorized this session as.
    pub fn set_identity(&mut self, service: &str, user: String) {
        self.identities.insert(service.to_owned(), user);
    }

    /// The identity this session holds for `service`, if authorized.
    pub fn identity(&self, service: &str) -> Option<&str> {
        self.identities.get(service).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: u64) -> (ClientLink, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientLink::new(ConnectionId::new(id), tx), rx)
    }

    #[test]
    fn test_session_id_is_32_hex_chars() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_session_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&SessionId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn test_default_config() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.closed_session_grace, Duration::from_secs(30));
        assert_eq!(cfg.idle_output_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_new_session_is_active_and_bound() {
        let (l, _rx) = link(1);
        let session = Session::new(SessionId::generate(), l);
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(session.is_bound_to(ConnectionId::new(1)));
        assert!(!session.is_idle());
    }

    #[test]
    fn test_unbind_other_client_is_noop() {
        let (l1, _rx1) = link(1);
        let (l2, _rx2) = link(2);
        let mut session = Session::new(SessionId::generate(), l1);
        let previous = session.bind(l2);
        assert_eq!(previous.map(|c| c.id()), Some(ConnectionId::new(1)));

        assert!(!session.unbind(ConnectionId::new(1)));
        assert!(session.is_bound_to(ConnectionId::new(2)));
    }

    #[test]
    fn test_status_transitions_are_observable() {
        let (l1, _rx1) = link(1);
        let mut session = Session::new(SessionId::generate(), l1);
        let rx = session.subscribe();

        assert!(session.unbind(ConnectionId::new(1)));
        assert_eq!(*rx.borrow(), SessionStatus::Idle);
        assert!(session.is_idle());

        let (l2, _rx2) = link(2);
        session.bind(l2);
        assert_eq!(*rx.borrow(), SessionStatus::Active);

        session.mark_closed();
        assert_eq!(*rx.borrow(), SessionStatus::Closed);
    }

    #[test]
    fn test_link_send_fails_after_writer_drops() {
        let (l, rx) = link(3);
        drop(rx);
        assert!(l.is_closed());
        assert!(matches!(l.send(b"x".to_vec()), Err(SessionError::LinkClosed(_))));
    }

    #[test]
    fn test_identities_are_per_service() {
        let (l, _rx) = link(1);
        let mut session = Session::new(SessionId::generate(), l);
        session.set_identity("chat", "u1".into());
        assert_eq!(session.identity("chat"), Some("u1"));
        assert_eq!(session.identity("lobby"), None);
    }
}
