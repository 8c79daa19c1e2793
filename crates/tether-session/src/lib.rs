//! Resumable sessions for Tether.
//!
//! This crate owns the state that survives a dropped socket:
//!
//! 1. **Sessions** ([`Session`]): id, counters, outbox, bound client
//! 2. **The message channel** (methods on [`Session`]): sequencing,
//!    acknowledgment, transmission and replay
//! 3. **The store** ([`SessionStore`]): every live session by id
//!
//! # How it fits in the stack
//!
//! ```text
//! Group Layer (above)  ← addresses deliveries to session ids
//!     ↕
//! Session Layer (this crate)  ← outbox, acks, resume window
//!     ↕
//! Protocol Layer (below)  ← frame types and the JSON codec
//! ```

mod channel;
mod error;
mod session;
mod store;

pub use channel::{OutboxMessage, Sequencing, send_unsequenced};
pub use error::SessionError;
pub use session::{
    ClientLink, Outgoing, Session, SessionConfig, SessionId, SessionStatus,
};
pub use store::SessionStore;
