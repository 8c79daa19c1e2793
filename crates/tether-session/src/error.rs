//! Error types for the session layer.

use tether_protocol::{ConnectionId, ProtocolError};

use crate::SessionId;

/// Errors that can occur while managing sessions and their channels.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists with this id (never created, or destroyed).
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The connection's writer task is gone; nothing more can be sent.
    #[error("connection {0} is closed")]
    LinkClosed(ConnectionId),

    /// The session has no bound client to transmit to.
    #[error("session {0} has no client")]
    Unbound(SessionId),

    /// An outbound frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
