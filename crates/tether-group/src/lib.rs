//! Group membership and fan-out for Tether.
//!
//! A *group* is a named broadcast domain inside one service ("chat" /
//! "lobby"). Sessions join and leave; the registry works out who needs
//! to hear about it and hands back a list of [`Delivery`]s for the
//! caller to push through each session's message channel.
//!
//! # Key types
//!
//! - [`GroupRegistry`]: membership index, join/leave/close/event
//! - [`GroupKey`]: `(service, group)`
//! - [`Recipient`]: who inside a group an event is for
//! - [`Delivery`]: one outbound body addressed to one session

mod error;
mod registry;

pub use error::GroupError;
pub use registry::{Delivery, GroupKey, GroupRegistry, Recipient};
