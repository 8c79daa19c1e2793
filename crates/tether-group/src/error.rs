//! Error types for the group layer.

use tether_protocol::ErrorCode;
use tether_session::SessionId;

use crate::GroupKey;

/// Errors that can occur during group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// The group does not exist (never joined, or already emptied).
    #[error("group {0} not found")]
    NotFound(GroupKey),

    /// The session is not a member of this group.
    #[error("session {session} not in group {key}")]
    NotMember { key: GroupKey, session: SessionId },

    /// The session is already a member of this group.
    #[error("session {session} already joined group {key}")]
    AlreadyJoined { key: GroupKey, session: SessionId },
}

impl GroupError {
    /// The wire code a client sees for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::NotMember { .. } => ErrorCode::NotFound,
            Self::AlreadyJoined { .. } => ErrorCode::PreconditionFailed,
        }
    }
}
