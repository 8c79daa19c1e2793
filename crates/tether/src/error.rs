//! Unified error type for the Tether framework.

use tether_group::GroupError;
use tether_protocol::ProtocolError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates `From` impls, so
/// the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (malformed frame, schema, encode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (missing session, closed link).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A group-level error (not a member, already joined).
    #[error(transparent)]
    Group(#[from] GroupError),

    /// The server has stopped and no longer accepts commands.
    #[error("server stopped")]
    Stopped,
}
