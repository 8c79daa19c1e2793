//! Wire protocol for Tether.
//!
//! This crate defines the frames clients and servers exchange:
//!
//! - **Inbound** ([`Envelope`], [`Inbound`]): client frames, validated
//!   in two scoped steps so errors name only the relevant schema.
//! - **Outbound** ([`OutboundFrame`], [`OutboundBody`]): server frames,
//!   sequenced or not.
//! - **Errors** ([`ProtocolError`], [`ErrorCode`]): decode failures and
//!   the numeric codes clients see.
//! - **Close codes** ([`close`]): which closes end a session and which
//!   leave it resumable.
//!
//! ```text
//! Transport (bytes) → Protocol (frames) → Session (outbox, sequencing)
//! ```

pub mod close;
mod codec;
mod error;
mod inbound;
mod outbound;

pub use codec::{Codec, JsonCodec};
pub use error::{ErrorCode, ProtocolError, SchemaScope};
pub use inbound::{
    AuthorizeBody, Envelope, EventBody, Inbound, InboundKind, JoinBody,
    LeaveBody, OpenBody, RequestBody, ResumeBody,
};
pub use outbound::{
    ErrorBody, EventPayload, JoinedBody, LeftBody, OutboundBody,
    OutboundFrame, OutboundKind, PresenceBody, ResponseBody, SessionBody,
    now_millis,
};
pub use tether_transport::ConnectionId;

/// The protocol version this server speaks. `open` negotiates down to
/// the lower of this and the client's version.
pub const PROTOCOL_VERSION: u32 = 1;
