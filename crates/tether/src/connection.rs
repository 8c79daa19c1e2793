//! Per-connection tasks: one reader, one writer.
//!
//! Each accepted socket gets:
//!   1. A writer task draining an unbounded queue of [`Outgoing`] items,
//!      so nothing that enqueues a frame ever waits on the network.
//!   2. The reader loop (this task), which feeds every frame to the
//!      dispatcher one at a time, giving per-connection FIFO processing.
//!
//! When the reader loop ends, a drop guard hands the closed client to
//! the lifecycle controller.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tether_protocol::{ConnectionId, close};
use tether_session::{ClientLink, Outgoing, SessionId};
use tether_transport::{CloseInfo, Connection, Incoming, PeerInfo, WebSocketConnection};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace};

use crate::server::ServerState;
use crate::{dispatcher, lifecycle};

/// One physical connection, as the router sees it.
///
/// Never outlives its socket: it is dropped from the server's client
/// table as soon as the reader loop ends.
#[derive(Debug)]
pub(crate) struct Client {
    pub(crate) id: ConnectionId,
    pub(crate) peer: PeerInfo,
    pub(crate) link: ClientLink,
    session: Mutex<Option<SessionId>>,
    version: OnceLock<u32>,
    /// Set exactly once, by whichever side closes first.
    closed: OnceLock<CloseInfo>,
    closing: Notify,
}

impl Client {
    pub(crate) fn new(id: ConnectionId, peer: PeerInfo, link: ClientLink) -> Self {
        Self {
            id,
            peer,
            link,
            session: Mutex::new(None),
            version: OnceLock::new(),
            closed: OnceLock::new(),
            closing: Notify::new(),
        }
    }

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn bind_session(&self, session: SessionId) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub(crate) fn set_version(&self, version: u32) {
        let _ = self.version.set(version);
    }

    /// The negotiated protocol version, once `open` succeeded.
    pub(crate) fn version(&self) -> Option<u32> {
        self.version.get().copied()
    }

    /// Closes the socket from the server side. Returns `false` if the
    /// client was already closed.
    pub(crate) fn close(&self, code: u16, reason: &str) -> bool {
        if self.closed.set(CloseInfo::new(code, reason)).is_err() {
            return false;
        }
        info!(client_id = %self.id, code, reason, "closing client");
        if let Err(e) = self.link.close(code, reason) {
            trace!(client_id = %self.id, error = %e, "writer already gone");
        }
        self.closing.notify_one();
        true
    }

    /// Records a close initiated by the peer or the network.
    fn mark_closed(&self, info: CloseInfo) {
        let _ = self.closed.set(info);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// The close code, once closed.
    pub(crate) fn close_code(&self) -> Option<u16> {
        self.closed.get().map(|info| info.code)
    }
}

/// Hands the client to the lifecycle controller when the reader loop
/// exits, even if it exits by panicking. `Drop` is synchronous, so the
/// async cleanup is spawned.
struct ClientGuard {
    client: Arc<Client>,
    state: Arc<ServerState>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            lifecycle::client_closed(&state, &client).await;
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(conn: WebSocketConnection, state: Arc<ServerState>) {
    let conn = Arc::new(conn);
    let id = conn.id();
    let peer = conn.peer().clone();
    debug!(client_id = %id, addr = ?peer.addr, user_agent = ?peer.user_agent, "client connected");

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(Arc::clone(&conn), rx));

    let link = ClientLink::new(id, tx).with_idle_output(state.timers.idle_output.clone());
    let client = Arc::new(Client::new(id, peer, link));
    state.register_client(Arc::clone(&client));
    state.timers.inbound_idle.add(id, ());
    state.timers.idle_output.add(id, ());

    let _guard = ClientGuard {
        client: Arc::clone(&client),
        state: Arc::clone(&state),
    };

    loop {
        let incoming = tokio::select! {
            biased;
            _ = client.closing.notified() => break,
            incoming = conn.recv() => incoming,
        };

        match incoming {
            Ok(Incoming::Data(data)) => {
                state.timers.inbound_idle.add(id, ());
                dispatcher::handle_frame(&state, &client, &data).await;
            }
            Ok(Incoming::Closed(info)) => {
                let info = info.unwrap_or_else(|| CloseInfo::new(close::ABNORMAL, ""));
                debug!(client_id = %id, code = info.code, reason = %info.reason, "peer closed");
                client.mark_closed(info);
                break;
            }
            Err(e) => {
                debug!(client_id = %id, error = %e, "recv failed");
                client.mark_closed(CloseInfo::new(close::ABNORMAL, e.to_string()));
                break;
            }
        }
    }

    // _guard drops here → lifecycle cleanup runs.
}

/// Drains the outgoing queue onto the socket. Ends after a close, or
/// once every sender is gone.
async fn write_loop(conn: Arc<WebSocketConnection>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let id = conn.id();
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Frame(bytes) => {
                if let Err(e) = conn.send(&bytes).await {
                    // The outbox keeps the message; replay delivers it.
                    trace!(client_id = %id, error = %e, "send failed");
                }
            }
            Outgoing::Close { code, reason } => {
                if let Err(e) = conn.close(code, &reason).await {
                    trace!(client_id = %id, error = %e, "close failed");
                }
                break;
            }
        }
    }
    trace!(client_id = %id, "writer finished");
}
