//! Error types and wire error codes for the protocol layer.

use std::fmt;

use crate::InboundKind;

/// Numeric error codes carried by `error` frames.
///
/// The numbers follow HTTP conventions so client code can switch on
/// familiar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Resume rejected. Deliberately uniform: it never says whether the
    /// session exists.
    Unauthorized,
    /// Unknown service, method, or a leave/event for a group that was
    /// never joined.
    NotFound,
    /// The frame does not fit the connection's session state (e.g. a
    /// request before `open`, or `open` twice).
    SessionState,
    /// A concurrent duplicate of an operation that is still in flight.
    Conflict,
    /// A handler-level precondition does not hold.
    PreconditionFailed,
    /// The frame is not a JSON object.
    MalformedFrame,
    /// The frame is JSON but does not match its schema.
    SchemaViolation,
    /// Anything unexpected. Details stay in the server log.
    Internal,
}

impl ErrorCode {
    /// Returns the numeric wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::SessionState => 405,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::MalformedFrame => 415,
            Self::SchemaViolation => 422,
            Self::Internal => 500,
        }
    }

    /// Maps a numeric wire value back to a known code.
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            405 => Self::SessionState,
            409 => Self::Conflict,
            412 => Self::PreconditionFailed,
            415 => Self::MalformedFrame,
            422 => Self::SchemaViolation,
            500 => Self::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Where a schema violation was found.
///
/// Validation is scoped: once the `type` discriminant is known, only the
/// sub-schema for that type is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaScope {
    /// The outer frame (discriminant, `id`, `ack`, `body` keys).
    Frame,
    /// The body of one specific frame type.
    Kind(InboundKind),
}

impl fmt::Display for SchemaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame => f.write_str("frame"),
            Self::Kind(kind) => write!(f, "`{kind}` frame"),
        }
    }
}

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization of a typed value failed.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The bytes are not a JSON object at all.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame parsed but violates the schema for its scope.
    #[error("invalid {scope}: {message}")]
    Schema { scope: SchemaScope, message: String },
}

impl ProtocolError {
    pub(crate) fn schema(scope: SchemaScope, message: impl fmt::Display) -> Self {
        Self::Schema {
            scope,
            message: message.to_string(),
        }
    }

    /// The wire error code a client should see for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::MalformedFrame,
            Self::Schema { .. } => ErrorCode::SchemaViolation,
            Self::Encode(_) | Self::Decode(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_match_wire_values() {
        assert_eq!(ErrorCode::Unauthorized.as_u16(), 401);
        assert_eq!(ErrorCode::NotFound.as_u16(), 404);
        assert_eq!(ErrorCode::SessionState.as_u16(), 405);
        assert_eq!(ErrorCode::Conflict.as_u16(), 409);
        assert_eq!(ErrorCode::PreconditionFailed.as_u16(), 412);
        assert_eq!(ErrorCode::MalformedFrame.as_u16(), 415);
        assert_eq!(ErrorCode::SchemaViolation.as_u16(), 422);
        assert_eq!(ErrorCode::Internal.as_u16(), 500);
    }

    #[test]
    fn test_error_code_from_u16_unknown_is_none() {
        assert_eq!(ErrorCode::from_u16(409), Some(ErrorCode::Conflict));
        assert_eq!(ErrorCode::from_u16(418), None);
    }

    #[test]
    fn test_schema_error_display_names_scope() {
        let err = ProtocolError::schema(
            SchemaScope::Kind(InboundKind::Request),
            "missing field `method`",
        );
        assert_eq!(
            err.to_string(),
            "invalid `request` frame: missing field `method`"
        );
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
    }

    #[test]
    fn test_malformed_maps_to_415() {
        let err = ProtocolError::Malformed("not json".into());
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
    }
}
