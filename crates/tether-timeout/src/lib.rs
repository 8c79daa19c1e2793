//! Expiring keyed registries for Tether.
//!
//! Every timer in the protocol (inbound idle, idle output, closed-session
//! grace) is an entry in a [`TimeoutRegistry`]. One [`Clock`] sweeps all
//! registries on a single shared tick and each registry hands its expired
//! entries to its consumer as one batch per sweep.
//!
//! ```ignore
//! let (grace, mut expired) = TimeoutRegistry::new("closed-sessions", Duration::from_secs(30));
//! let mut clock = Clock::new(ClockConfig::default());
//! clock.register(grace.clone());
//! clock.spawn();
//!
//! grace.add(session_id, ());
//! while let Some(batch) = expired.recv().await {
//!     for (session_id, ()) in batch { /* destroy */ }
//! }
//! ```

mod clock;
mod registry;

pub use clock::{Clock, ClockConfig};
pub use registry::{Expirations, Sweep, TimeoutRegistry};
