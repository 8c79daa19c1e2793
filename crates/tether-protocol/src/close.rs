//! Close codes and what they mean for the session behind a connection.
//!
//! Codes in the 1xxx range come from the WebSocket protocol. The 4xxx
//! codes are this protocol's own. Anything at or above
//! [`CLIENT_TIMEOUT`] means the peer is not coming back, so the session
//! is destroyed on the spot; everything else starts the resume grace
//! period.

/// Normal closure.
pub const NORMAL: u16 = 1000;
/// Browser navigation or reload. The page will usually come back.
pub const PEER_AWAY: u16 = 1001;
/// Close frame without a status code.
pub const NO_STATUS: u16 = 1005;
/// Stream ended without any close frame.
pub const ABNORMAL: u16 = 1006;

/// A newer connection resumed this connection's session.
pub const SESSION_REPLACED: u16 = 4000;
/// The client sent nothing for longer than the inbound idle timeout.
pub const CLIENT_TIMEOUT: u16 = 4001;
/// The server is shutting down.
pub const SERVER_SHUTDOWN: u16 = 4002;
/// The client (or a service on its behalf) logged out.
pub const LOGOUT: u16 = 4003;
/// The client is leaving for good and will not resume.
pub const GOING_AWAY: u16 = 4004;

/// What happens to a session when its connection closes with a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Keep the session for the grace period so it can be resumed.
    Resumable,
    /// Destroy the session immediately.
    Terminal,
}

/// Classifies a close code.
pub fn classify(code: u16) -> CloseDisposition {
    if code >= CLIENT_TIMEOUT {
        CloseDisposition::Terminal
    } else {
        CloseDisposition::Resumable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_initiated_and_abnormal_codes_are_resumable() {
        for code in [NORMAL, PEER_AWAY, NO_STATUS, ABNORMAL] {
            assert_eq!(classify(code), CloseDisposition::Resumable, "{code}");
        }
    }

    #[test]
    fn test_replaced_is_resumable() {
        assert_eq!(classify(SESSION_REPLACED), CloseDisposition::Resumable);
    }

    #[test]
    fn test_server_defined_terminal_codes() {
        for code in [CLIENT_TIMEOUT, SERVER_SHUTDOWN, LOGOUT, GOING_AWAY] {
            assert_eq!(classify(code), CloseDisposition::Terminal, "{code}");
        }
    }

    #[test]
    fn test_application_codes_above_threshold_are_terminal() {
        assert_eq!(classify(4100), CloseDisposition::Terminal);
        assert_eq!(classify(4999), CloseDisposition::Terminal);
    }
}
