//! Client → server frames and their validation.
//!
//! Decoding happens in two steps so the dispatcher can sequence a frame
//! before it knows whether the body is valid:
//!
//! 1. [`Envelope::parse`] checks the outer shape: JSON object, known
//!    `type`, numeric `id`/`ack`, and an `id` on every sequenced kind.
//! 2. [`Envelope::into_message`] validates the body against the one
//!    sub-schema selected by `type`.
//!
//! A body error therefore names only the fields of the frame type the
//! client actually sent, never the union of every shape.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Codec, JsonCodec, ProtocolError, SchemaScope};

// ---------------------------------------------------------------------------
// Discriminant
// ---------------------------------------------------------------------------

/// The `type` discriminant of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    Open,
    Resume,
    Event,
    Request,
    Join,
    Leave,
    Authorize,
    Sync,
}

impl InboundKind {
    /// The wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resume => "resume",
            Self::Event => "event",
            Self::Request => "request",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Authorize => "authorize",
            Self::Sync => "sync",
        }
    }

    /// Whether frames of this kind carry an `id` and go through inbound
    /// sequencing.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Self::Event
                | Self::Request
                | Self::Join
                | Self::Leave
                | Self::Authorize
        )
    }

    /// Whether this kind needs a bound session.
    pub fn requires_session(self) -> bool {
        self.is_sequenced()
    }

    /// Whether this kind is only valid before a session is bound.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Open | Self::Resume)
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// `open {version}`: start a brand-new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenBody {
    pub version: u32,
}

/// `resume {sessionId}`: reattach to an orphaned session. The frame's
/// `ack` carries the last server message id the client processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResumeBody {
    pub session_id: String,
}

/// `event {service, group, type, data}`: a fire-and-forget group event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBody {
    pub service: String,
    pub group: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// `request {service, method, args}`: a call expecting a `response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestBody {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `join {service, group, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinBody {
    pub service: String,
    pub group: String,
    #[serde(default)]
    pub params: Value,
}

/// `leave {service, group}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaveBody {
    pub service: String,
    pub group: String,
}

/// `authorize {service, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizeBody {
    pub service: String,
    #[serde(default)]
    pub data: Value,
}

/// A fully validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Open(OpenBody),
    Resume(ResumeBody),
    Event(EventBody),
    Request(RequestBody),
    Join(JoinBody),
    Leave(LeaveBody),
    Authorize(AuthorizeBody),
    Sync,
}

impl Inbound {
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::Open(_) => InboundKind::Open,
            Self::Resume(_) => InboundKind::Resume,
            Self::Event(_) => InboundKind::Event,
            Self::Request(_) => InboundKind::Request,
            Self::Join(_) => InboundKind::Join,
            Self::Leave(_) => InboundKind::Leave,
            Self::Authorize(_) => InboundKind::Authorize,
            Self::Sync => InboundKind::Sync,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer shape shared by every inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub ack: Option<u64>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Envelope {
    /// Parses the outer frame.
    ///
    /// # Errors
    /// - [`ProtocolError::Malformed`] (415) if the bytes are not a JSON
    ///   object.
    /// - [`ProtocolError::Schema`] (422) scoped to the frame if the
    ///   discriminant is unknown, a counter is not a number, or a
    ///   sequenced kind lacks its `id`.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = JsonCodec.decode(data).map_err(|e| match e {
            ProtocolError::Decode(e) => ProtocolError::Malformed(e.to_string()),
            other => other,
        })?;
        if !value.is_object() {
            return Err(ProtocolError::Malformed("frame must be a JSON object".into()));
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ProtocolError::schema(SchemaScope::Frame, e))?;

        if envelope.kind.is_sequenced() && envelope.id.is_none() {
            return Err(ProtocolError::schema(
                SchemaScope::Kind(envelope.kind),
                "missing field `id`",
            ));
        }
        Ok(envelope)
    }

    /// Validates the body against the sub-schema for `self.kind`.
    pub fn into_message(self) -> Result<Inbound, ProtocolError> {
        let kind = self.kind;
        let message = match kind {
            InboundKind::Sync => {
                match self.body {
                    None | Some(Value::Null) => {}
                    Some(_) => {
                        return Err(ProtocolError::schema(
                            SchemaScope::Kind(kind),
                            "`sync` frames carry no body",
                        ));
                    }
                }
                Inbound::Sync
            }
            InboundKind::Open => Inbound::Open(body(kind, self.body)?),
            InboundKind::Resume => {
                let resume: ResumeBody = body(kind, self.body)?;
                non_empty(kind, "sessionId", &resume.session_id)?;
                Inbound::Resume(resume)
            }
            InboundKind::Event => {
                let event: EventBody = body(kind, self.body)?;
                non_empty(kind, "service", &event.service)?;
                non_empty(kind, "group", &event.group)?;
                non_empty(kind, "type", &event.kind)?;
                Inbound::Event(event)
            }
            InboundKind::Request => {
                let request: RequestBody = body(kind, self.body)?;
                non_empty(kind, "service", &request.service)?;
                non_empty(kind, "method", &request.method)?;
                Inbound::Request(request)
            }
            InboundKind::Join => {
                let join: JoinBody = body(kind, self.body)?;
                non_empty(kind, "service", &join.service)?;
                non_empty(kind, "group", &join.group)?;
                Inbound::Join(join)
            }
            InboundKind::Leave => {
                let leave: LeaveBody = body(kind, self.body)?;
                non_empty(kind, "service", &leave.service)?;
                non_empty(kind, "group", &leave.group)?;
                Inbound::Leave(leave)
            }
            InboundKind::Authorize => {
                let authorize: AuthorizeBody = body(kind, self.body)?;
                non_empty(kind, "service", &authorize.service)?;
                Inbound::Authorize(authorize)
            }
        };
        Ok(message)
    }
}

fn body<T: DeserializeOwned>(kind: InboundKind, body: Option<Value>) -> Result<T, ProtocolError> {
    let Some(body) = body else {
        return Err(ProtocolError::schema(SchemaScope::Kind(kind), "missing field `body`"));
    };
    serde_json::from_value(body)
        .map_err(|e| ProtocolError::schema(SchemaScope::Kind(kind), e))
}

fn non_empty(kind: InboundKind, field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::schema(
            SchemaScope::Kind(kind),
            format!("field `{field}` must not be empty"),
        ));
    }
    Ok(())
}
