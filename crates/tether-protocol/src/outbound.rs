//! Server → client frames.
//!
//! Every outbound frame has the same outer shape:
//!
//! ```text
//! { "type": "response", "id": 7, "ack": 3, "ts": 1718000000000, "body": {...} }
//! ```
//!
//! - `id` is present only on sequenced messages (the ones kept in the
//!   session outbox until acknowledged). `session` and `sync` frames are
//!   unsequenced.
//! - `ack` piggy-backs the last client message id the server processed.
//! - `ts` is the server clock in milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `type` discriminant of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Session,
    Response,
    Event,
    Enter,
    Exit,
    Join,
    Leave,
    Sync,
    Error,
}

/// `session`: reply to `open` (new id + negotiated version) or `resume`
/// (echoed ack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

/// `response`: the result of a `request` or `authorize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub request_id: u64,
    pub data: Value,
}

/// `error`: a failure, tied to the inbound frame id when there is one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub code: u16,
    pub message: String,
}

/// `event`: a group event fanned out by a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub service: String,
    pub group: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// `enter` / `exit`: an identity appeared in or left a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBody {
    pub service: String,
    pub group: String,
    pub user: String,
}

/// `join`: confirmation with the distinct identities now in the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub service: String,
    pub group: String,
    pub users: Vec<String>,
}

/// `leave`: the session is no longer in the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeftBody {
    pub service: String,
    pub group: String,
}

/// The body of a sequenced outbound message.
///
/// Serialized untagged: the discriminant lives on the frame, not the body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundBody {
    Response(ResponseBody),
    Error(ErrorBody),
    Event(EventPayload),
    Enter(PresenceBody),
    Exit(PresenceBody),
    Join(JoinedBody),
    Leave(LeftBody),
}

impl OutboundBody {
    /// The frame type this body travels under.
    pub fn kind(&self) -> OutboundKind {
        match self {
            Self::Response(_) => OutboundKind::Response,
            Self::Error(_) => OutboundKind::Error,
            Self::Event(_) => OutboundKind::Event,
            Self::Enter(_) => OutboundKind::Enter,
            Self::Exit(_) => OutboundKind::Exit,
            Self::Join(_) => OutboundKind::Join,
            Self::Leave(_) => OutboundKind::Leave,
        }
    }
}

/// The outer shape of every server → client frame.
///
/// Generic over the body so the server can serialize borrowed typed
/// bodies while clients (and tests) decode into [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame<B = Value> {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub ack: u64,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<B>,
}

/// Milliseconds since the Unix epoch, for the `ts` field.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
