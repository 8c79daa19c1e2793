//! Services: the application code the router dispatches to.
//!
//! A service is a named table of async handlers, built once at startup:
//!
//! ```rust,ignore
//! let chat = Service::builder("chat")
//!     .on_authorize(|_ctx, data| async move { /* … */ })
//!     .on_join(|ctx, _group, _params| async move {
//!         Ok(ctx.require_user()?.to_owned())
//!     })
//!     .event("message", |ctx, group, data| async move {
//!         ctx.handle().send_event(&group, Recipient::All, "message", data)?;
//!         Ok(())
//!     })
//!     .request("ping", |_ctx, _args| async move { Ok(json!("pong")) })
//!     .build();
//! ```
//!
//! Handlers never touch the group registry directly. They report what
//! should happen through a [`ServiceHandle`], which queues a
//! [`ServiceCommand`] for the router's command loop.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tether_group::Recipient;
use tether_protocol::{ConnectionId, ErrorBody, ErrorCode};
use tether_session::{SessionId, SessionStatus};
use tokio::sync::{mpsc, watch};

use crate::TetherError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A typed failure returned by a handler. Sent to the client as an
/// `error` frame carrying `code` and `message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: u16,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound.as_u16(), message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed.as_u16(), message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict.as_u16(), message)
    }

    /// The opaque error clients see when a handler fails unexpectedly.
    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal.as_u16(), "internal server error")
    }

    pub(crate) fn into_body(self, request_id: Option<u64>) -> ErrorBody {
        ErrorBody {
            request_id,
            code: self.code,
            message: self.message,
        }
    }
}

impl From<ErrorCode> for ServiceError {
    fn from(code: ErrorCode) -> Self {
        let message = match code {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotFound => "not found",
            ErrorCode::SessionState => "invalid session state",
            ErrorCode::Conflict => "concurrent conflict",
            ErrorCode::PreconditionFailed => "precondition failed",
            ErrorCode::MalformedFrame => "malformed frame",
            ErrorCode::SchemaViolation => "schema violation",
            ErrorCode::Internal => "internal server error",
        };
        Self::new(code.as_u16(), message)
    }
}

impl From<TetherError> for ServiceError {
    fn from(err: TetherError) -> Self {
        tracing::warn!(error = %err, "service command failed");
        Self::internal()
    }
}

/// What an authorize handler hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    /// The identity this session holds for the service from now on.
    pub user: String,
    /// Returned to the client as the `response` data.
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Something a service asked the router to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCommand {
    /// Put `session` in a group as `user`.
    JoinGroup {
        service: String,
        group: String,
        session: SessionId,
        user: String,
    },
    /// Take `session` out of a group.
    LeaveGroup {
        service: String,
        group: String,
        session: SessionId,
    },
    /// Send `leave` to every member and delete the group.
    CloseGroup { service: String, group: String },
    /// Fan an event out within a group.
    Event {
        service: String,
        group: String,
        recipient: Recipient,
        kind: String,
        data: Value,
    },
    /// End `session` for good.
    Logout { session: SessionId },
}

/// A service's channel back into the router.
///
/// Cheap to clone. Every method only queues a command, so it can be
/// called from any task, including ones that outlive the request that
/// spawned them.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    service: String,
    tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl ServiceHandle {
    pub(crate) fn new(
        service: impl Into<String>,
        tx: mpsc::UnboundedSender<ServiceCommand>,
    ) -> Self {
        Self {
            service: service.into(),
            tx,
        }
    }

    /// The service this handle speaks for.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn send(&self, command: ServiceCommand) -> Result<(), TetherError> {
        self.tx.send(command).map_err(|_| TetherError::Stopped)
    }

    pub fn join_group(
        &self,
        group: &str,
        session: &SessionId,
        user: &str,
    ) -> Result<(), TetherError> {
        self.send(ServiceCommand::JoinGroup {
            service: self.service.clone(),
            group: group.to_owned(),
            session: session.clone(),
            user: user.to_owned(),
        })
    }

    pub fn leave_group(&self, group: &str, session: &SessionId) -> Result<(), TetherError> {
        self.send(ServiceCommand::LeaveGroup {
            service: self.service.clone(),
            group: group.to_owned(),
            session: session.clone(),
        })
    }

    pub fn close_group(&self, group: &str) -> Result<(), TetherError> {
        self.send(ServiceCommand::CloseGroup {
            service: self.service.clone(),
            group: group.to_owned(),
        })
    }

    pub fn send_event(
        &self,
        group: &str,
        recipient: Recipient,
        kind: &str,
        data: Value,
    ) -> Result<(), TetherError> {
        self.send(ServiceCommand::Event {
            service: self.service.clone(),
            group: group.to_owned(),
            recipient,
            kind: kind.to_owned(),
            data,
        })
    }

    pub fn logout(&self, session: &SessionId) -> Result<(), TetherError> {
        self.send(ServiceCommand::Logout {
            session: session.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a handler knows about the caller.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    session_id: SessionId,
    client_id: Option<ConnectionId>,
    user: Option<String>,
    handle: ServiceHandle,
    status: watch::Receiver<SessionStatus>,
}

impl ServiceContext {
    pub(crate) fn new(
        session_id: SessionId,
        client_id: Option<ConnectionId>,
        user: Option<String>,
        handle: ServiceHandle,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            user,
            handle,
            status,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The connection the triggering frame arrived on. `None` for leave
    /// hooks run after the session lost its connection.
    pub fn client_id(&self) -> Option<ConnectionId> {
        self.client_id
    }

    /// The identity this session was authorized as for this service.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Like [`user`](Self::user), failing with 412 when the session has
    /// not authorized with this service.
    pub fn require_user(&self) -> Result<&str, ServiceError> {
        self.user().ok_or_else(|| {
            ServiceError::precondition_failed(format!(
                "not authorized for service `{}`",
                self.handle.service()
            ))
        })
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Watches the session's lifecycle. Resolves to
    /// [`SessionStatus::Closed`] once the session is destroyed.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub(crate) type RequestHandler = Arc<
    dyn Fn(ServiceContext, Vec<Value>) -> BoxFuture<'static, Result<Value, ServiceError>>
        + Send
        + Sync,
>;
pub(crate) type EventHandler = Arc<
    dyn Fn(ServiceContext, String, Value) -> BoxFuture<'static, Result<(), ServiceError>>
        + Send
        + Sync,
>;
pub(crate) type JoinHandler = Arc<
    dyn Fn(ServiceContext, String, Value) -> BoxFuture<'static, Result<String, ServiceError>>
        + Send
        + Sync,
>;
pub(crate) type LeaveHandler = Arc<
    dyn Fn(ServiceContext, String) -> BoxFuture<'static, Result<(), ServiceError>>
        + Send
        + Sync,
>;
pub(crate) type AuthorizeHandler = Arc<
    dyn Fn(ServiceContext, Value) -> BoxFuture<'static, Result<Authorization, ServiceError>>
        + Send
        + Sync,
>;

/// A named set of handlers. Build one with [`Service::builder`].
#[derive(Clone)]
pub struct Service {
    name: String,
    requests: HashMap<String, RequestHandler>,
    events: HashMap<String, EventHandler>,
    on_join: Option<JoinHandler>,
    on_leave: Option<LeaveHandler>,
    on_authorize: Option<AuthorizeHandler>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("on_join", &self.on_join.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .field("on_authorize", &self.on_authorize.is_some())
            .finish()
    }
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            service: Service {
                name: name.into(),
                requests: HashMap::new(),
                events: HashMap::new(),
                on_join: None,
                on_leave: None,
                on_authorize: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn request(&self, method: &str) -> Option<&RequestHandler> {
        self.requests.get(method)
    }

    pub(crate) fn event(&self, kind: &str) -> Option<&EventHandler> {
        self.events.get(kind)
    }

    pub(crate) fn join(&self) -> Option<&JoinHandler> {
        self.on_join.as_ref()
    }

    pub(crate) fn leave(&self) -> Option<&LeaveHandler> {
        self.on_leave.as_ref()
    }

    pub(crate) fn authorize(&self) -> Option<&AuthorizeHandler> {
        self.on_authorize.as_ref()
    }
}

/// Registers handlers on a [`Service`].
pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    /// Handles `request {service, method, args}` for `method`.
    pub fn request<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ServiceError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(
            move |ctx: ServiceContext, args: Vec<Value>| handler(ctx, args).boxed(),
        );
        self.service.requests.insert(method.to_owned(), handler);
        self
    }

    /// Handles `event {service, group, type, data}` for `kind`. The
    /// handler receives the group name and the event data.
    pub fn event<F, Fut>(mut self, kind: &str, handler: F) -> Self
    where
        F: Fn(ServiceContext, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(
            move |ctx: ServiceContext, group: String, data: Value| {
                handler(ctx, group, data).boxed()
            },
        );
        self.service.events.insert(kind.to_owned(), handler);
        self
    }

    /// Decides whether a session may join a group, and as whom. The
    /// returned identity is what other members see in `enter`/`exit`.
    pub fn on_join<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ServiceContext, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ServiceError>> + Send + 'static,
    {
        let handler: JoinHandler = Arc::new(
            move |ctx: ServiceContext, group: String, params: Value| {
                handler(ctx, group, params).boxed()
            },
        );
        self.service.on_join = Some(handler);
        self
    }

    /// Called after a session has left a group, whether it asked to or
    /// its session was destroyed.
    pub fn on_leave<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ServiceContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let handler: LeaveHandler = Arc::new(
            move |ctx: ServiceContext, group: String| handler(ctx, group).boxed(),
        );
        self.service.on_leave = Some(handler);
        self
    }

    pub fn on_authorize<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ServiceContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Authorization, ServiceError>> + Send + 'static,
    {
        let handler: AuthorizeHandler = Arc::new(
            move |ctx: ServiceContext, data: Value| handler(ctx, data).boxed(),
        );
        self.service.on_authorize = Some(handler);
        self
    }

    pub fn build(self) -> Service {
        self.service
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context(user: Option<&str>) -> (ServiceContext, mpsc::UnboundedReceiver<ServiceCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_status_tx, status) = watch::channel(SessionStatus::Active);
        let ctx = ServiceContext::new(
            SessionId::from("s1"),
            Some(ConnectionId::new(1)),
            user.map(String::from),
            ServiceHandle::new("chat", tx),
            status,
        );
        (ctx, rx)
    }

    #[test]
    fn test_require_user_without_authorization_is_412() {
        let (ctx, _rx) = context(None);
        let err = ctx.require_user().unwrap_err();
        assert_eq!(err.code, 412);
        assert!(err.message.contains("chat"));
    }

    #[test]
    fn test_require_user_returns_identity() {
        let (ctx, _rx) = context(Some("u1"));
        assert_eq!(ctx.require_user(), Ok("u1"));
    }

    #[test]
    fn test_handle_queues_commands_for_its_service() {
        let (ctx, mut rx) = context(None);
        ctx.handle()
            .send_event("lobby", Recipient::All, "message", json!(1))
            .unwrap();
        ctx.handle().close_group("lobby").unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServiceCommand::Event { service, kind, .. } if service == "chat" && kind == "message"
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServiceCommand::CloseGroup {
                service: "chat".into(),
                group: "lobby".into()
            }
        );
    }

    #[test]
    fn test_handle_after_router_stopped() {
        let (ctx, rx) = context(None);
        drop(rx);
        assert!(matches!(
            ctx.handle().logout(&SessionId::from("s1")),
            Err(TetherError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_builder_registers_handlers() {
        let service = Service::builder("lobby")
            .request("ping", |_ctx, _args| async { Ok(json!("pong")) })
            .event("chat", |_ctx, _group, _data| async { Ok(()) })
            .build();

        assert_eq!(service.name(), "lobby");
        assert!(service.request("ping").is_some());
        assert!(service.request("pong").is_none());
        assert!(service.event("chat").is_some());
        assert!(service.join().is_none());

        let (ctx, _rx) = context(None);
        let reply = service.request("ping").unwrap()(ctx, vec![]).await;
        assert_eq!(reply, Ok(json!("pong")));
    }

    #[test]
    fn test_error_code_conversion() {
        let err = ServiceError::from(ErrorCode::Conflict);
        assert_eq!(err.code, 409);
        let body = err.into_body(Some(3));
        assert_eq!(body.request_id, Some(3));
    }
}
