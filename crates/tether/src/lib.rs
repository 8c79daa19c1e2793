//! # Tether
//!
//! Reliable, resumable session messaging over WebSockets.
//!
//! A client opens a *session* that outlives any one socket. Every server
//! message is numbered and kept until the client acknowledges it, so a
//! client that drops and resumes within the grace period loses nothing
//! and sees nothing twice. Application code lives in [`Service`]s: named
//! tables of request, event and group handlers the router dispatches to.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether::prelude::*;
//!
//! # async fn start() -> Result<(), TetherError> {
//! let lobby = Service::builder("lobby")
//!     .request("ping", |_ctx, _args| async move { Ok(json!("pong")) })
//!     .build();
//!
//! let server = TetherServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .service(lobby)
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod connection;
mod dispatcher;
mod error;
mod inflight;
mod lifecycle;
mod server;
mod service;

pub use error::TetherError;
pub use server::{ServerHandle, TetherServer, TetherServerBuilder};
pub use service::{
    Authorization, Service, ServiceBuilder, ServiceCommand, ServiceContext, ServiceError,
    ServiceHandle,
};
pub use tether_group::Recipient;
pub use tether_protocol::{ErrorCode, PROTOCOL_VERSION, close};
pub use tether_session::{SessionConfig, SessionId, SessionStatus};
pub use tether_timeout::ClockConfig;

/// Everything needed to write a service and start a server.
pub mod prelude {
    pub use crate::{
        Authorization, ClockConfig, ErrorCode, PROTOCOL_VERSION, Recipient, ServerHandle, Service,
        ServiceContext, ServiceError, ServiceHandle, SessionConfig, SessionId, SessionStatus,
        TetherError, TetherServer, TetherServerBuilder, close,
    };
}
