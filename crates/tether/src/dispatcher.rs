//! The dispatcher: validates each inbound frame and routes it.
//!
//! Intake is strictly in order for a connection:
//!
//! ```text
//! parse envelope ──→ session-state check ──→ purge(ack) ──→ sequence(id)
//!      │                                                        │
//!   415/422                                    duplicate: drop  │  gap: sync
//!                                                               ▼
//!                                   validate body ──→ route by `type`
//! ```
//!
//! `event` and `leave` run to completion before the next frame is read.
//! `request`, `join` and `authorize` claim their in-flight key and then
//! run on their own task, so a slow handler does not stall the
//! connection. That is what makes a concurrent duplicate possible, and
//! what the in-flight guard is for.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use tether_group::GroupKey;
use tether_protocol::{
    AuthorizeBody, Envelope, ErrorCode, EventBody, Inbound, JoinBody, LeaveBody, OutboundBody,
    OutboundKind, RequestBody, ResponseBody,
};
use tether_session::{Sequencing, SessionId, send_unsequenced};
use tracing::{debug, error, trace, warn};

use crate::connection::Client;
use crate::inflight::InflightKey;
use crate::server::ServerState;
use crate::service::Service;
use crate::{ServiceContext, ServiceError, lifecycle};

/// Handles one inbound frame from `client`.
pub(crate) async fn handle_frame(state: &Arc<ServerState>, client: &Client, data: &[u8]) {
    let envelope = match Envelope::parse(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(client_id = %client.id, error = %e, "rejected frame");
            reply_error(state, client, None, ServiceError::new(e.code().as_u16(), e.to_string()))
                .await;
            return;
        }
    };

    let kind = envelope.kind;
    let request_id = envelope.id;
    let ack = envelope.ack;
    let session_id = client.session_id();

    match &session_id {
        None if kind.requires_session() => {
            reply_error(
                state,
                client,
                request_id,
                ServiceError::new(
                    ErrorCode::SessionState.as_u16(),
                    format!("must first open or resume before `{kind}`"),
                ),
            )
            .await;
            return;
        }
        Some(_) if kind.is_handshake() => {
            reply_error(
                state,
                client,
                request_id,
                ServiceError::new(ErrorCode::SessionState.as_u16(), "session already open"),
            )
            .await;
            return;
        }
        _ => {}
    }

    if let Some(session_id) = &session_id {
        let mut sessions = state.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            debug!(client_id = %client.id, %session_id, "frame for destroyed session dropped");
            return;
        };
        if !session.is_bound_to(client.id) {
            debug!(client_id = %client.id, %session_id, "frame from replaced client dropped");
            return;
        }

        if let Some(ack) = ack {
            let purged = session.purge(ack);
            trace!(%session_id, ack, purged, "outbox purged");
        }

        if let (true, Some(id)) = (kind.is_sequenced(), request_id) {
            match session.sequence(id) {
                Sequencing::Accepted => {}
                Sequencing::Duplicate => {
                    debug!(%session_id, id, "duplicate frame dropped");
                    return;
                }
                Sequencing::Gap { expected } => {
                    debug!(%session_id, id, expected, "gap in inbound ids, sending sync");
                    if let Err(e) = session.send_sync() {
                        debug!(%session_id, error = %e, "sync not sent");
                    }
                    return;
                }
            }
        }
    }

    let message = match envelope.into_message() {
        Ok(message) => message,
        Err(e) => {
            debug!(client_id = %client.id, error = %e, "rejected frame body");
            reply_error(
                state,
                client,
                request_id,
                ServiceError::new(e.code().as_u16(), e.to_string()),
            )
            .await;
            return;
        }
    };

    let id = request_id.unwrap_or_default();
    match (message, session_id) {
        (Inbound::Open(body), _) => lifecycle::open(state, client, body).await,
        (Inbound::Resume(body), _) => {
            lifecycle::resume(state, client, body, ack.unwrap_or_default()).await;
        }
        (Inbound::Sync, session_id) => sync(state, client, session_id.as_ref()).await,
        (Inbound::Request(body), Some(session_id)) => {
            request(state, client, session_id, id, body).await;
        }
        (Inbound::Join(body), Some(session_id)) => join(state, client, session_id, id, body).await,
        (Inbound::Leave(body), Some(session_id)) => {
            leave(state, client, session_id, id, body).await;
        }
        (Inbound::Event(body), Some(session_id)) => {
            event(state, client, session_id, id, body).await;
        }
        (Inbound::Authorize(body), Some(session_id)) => {
            authorize(state, client, session_id, id, body).await;
        }
        (message, None) => {
            error!(
                client_id = %client.id,
                kind = %message.kind(),
                "sessionless frame reached routing"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// `sync`: retransmit the whole outbox, then a bare `sync` with the
/// current ack.
async fn sync(state: &ServerState, client: &Client, session_id: Option<&SessionId>) {
    match session_id {
        Some(session_id) => resync(state, session_id).await,
        None => {
            if let Err(e) = send_unsequenced::<()>(&client.link, OutboundKind::Sync, 0, None) {
                trace!(client_id = %client.id, error = %e, "sync not sent");
            }
        }
    }
}

/// Replays the outbox of `session_id` and follows it with a `sync`.
pub(crate) async fn resync(state: &ServerState, session_id: &SessionId) {
    let mut sessions = state.sessions.lock().await;
    let Some(session) = sessions.get_mut(session_id) else {
        return;
    };
    let replayed = session.replay();
    if let Err(e) = session.send_sync() {
        trace!(%session_id, error = %e, "sync not sent");
    }
    trace!(%session_id, replayed, "resynced");
}

async fn request(
    state: &Arc<ServerState>,
    client: &Client,
    session_id: SessionId,
    id: u64,
    body: RequestBody,
) {
    let handler = match lookup(state, &body.service)
        .and_then(|s| s.request(&body.method).ok_or_else(|| no_method(&body)))
    {
        Ok(handler) => Arc::clone(handler),
        Err(e) => return reply_error(state, client, Some(id), e).await,
    };
    let Some(ctx) = context(state, &session_id, client, &body.service).await else {
        return;
    };

    let key = InflightKey::request(client.id, &body.service, &body.method, &body.args);
    let (reply, coalesced) = state.inflight.coalesce(key, |entry| {
        let args = body.args;
        guarded(async move {
            let _entry = entry;
            handler(ctx, args).await
        })
        .boxed()
        .shared()
    });
    if coalesced {
        debug!(
            client_id = %client.id,
            id,
            method = %body.method,
            "request coalesced with one in flight"
        );
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let body = match reply.await {
            Ok(data) => OutboundBody::Response(ResponseBody {
                request_id: id,
                data,
            }),
            Err(e) => OutboundBody::Error(e.into_body(Some(id))),
        };
        emit(&state, &session_id, body).await;
    });
}

async fn join(
    state: &Arc<ServerState>,
    client: &Client,
    session_id: SessionId,
    id: u64,
    body: JoinBody,
) {
    let handler = match lookup(state, &body.service).and_then(|s| {
        s.join().ok_or_else(|| {
            ServiceError::not_found(format!("service `{}` has no groups", body.service))
        })
    }) {
        Ok(handler) => Arc::clone(handler),
        Err(e) => return reply_error(state, client, Some(id), e).await,
    };

    let key = GroupKey::new(&body.service, &body.group);
    if state.groups.lock().await.is_member(&key, &session_id) {
        let e = ServiceError::precondition_failed(format!("already joined {key}"));
        return reply_error(state, client, Some(id), e).await;
    }
    let Some(entry) = state.inflight.try_begin(InflightKey::join(client.id, &key)) else {
        let e = ServiceError::conflict(format!("join for {key} already in progress"));
        return reply_error(state, client, Some(id), e).await;
    };
    let Some(ctx) = context(state, &session_id, client, &body.service).await else {
        return;
    };

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _entry = entry;
        let user = match guarded(handler(ctx, body.group, body.params)).await {
            Ok(user) => user,
            Err(e) => {
                emit(&state, &session_id, OutboundBody::Error(e.into_body(Some(id)))).await;
                return;
            }
        };

        let mut sessions = state.sessions.lock().await;
        let mut groups = state.groups.lock().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            debug!(%session_id, %key, "session gone before join completed");
            return;
        };
        match groups.join(&key, &session_id, &user, Some(id)) {
            Ok(deliveries) => lifecycle::deliver(&mut sessions, deliveries),
            Err(e) => {
                let e = ServiceError::new(e.code().as_u16(), e.to_string());
                session.enqueue(OutboundBody::Error(e.into_body(Some(id))));
            }
        }
    });
}

async fn leave(
    state: &ServerState,
    client: &Client,
    session_id: SessionId,
    id: u64,
    body: LeaveBody,
) {
    let service = match lookup(state, &body.service) {
        Ok(service) => service,
        Err(e) => return reply_error(state, client, Some(id), e).await,
    };

    let key = GroupKey::new(&body.service, &body.group);
    if state.inflight.contains(&InflightKey::join(client.id, &key)) {
        let e = ServiceError::conflict(format!("join for {key} still in progress"));
        return reply_error(state, client, Some(id), e).await;
    }

    let left = {
        let mut sessions = state.sessions.lock().await;
        let mut groups = state.groups.lock().await;
        groups.leave(&key, &session_id).map(|deliveries| {
            lifecycle::deliver(&mut sessions, deliveries);
            sessions
                .get(&session_id)
                .map(|session| build_context(state, session, &session_id, client, &body.service))
        })
    };
    let ctx = match left {
        Ok(ctx) => ctx,
        Err(e) => {
            let e = ServiceError::new(e.code().as_u16(), e.to_string());
            return reply_error(state, client, Some(id), e).await;
        }
    };

    if let (Some(hook), Some(ctx)) = (service.leave(), ctx) {
        if let Err(e) = guarded(hook(ctx, body.group)).await {
            warn!(%session_id, %key, error = %e, "leave hook failed");
        }
    }
}

async fn event(
    state: &ServerState,
    client: &Client,
    session_id: SessionId,
    id: u64,
    body: EventBody,
) {
    let handler = match lookup(state, &body.service).and_then(|s| {
        s.event(&body.kind).ok_or_else(|| {
            ServiceError::not_found(format!(
                "service `{}` has no event `{}`",
                body.service, body.kind
            ))
        })
    }) {
        Ok(handler) => Arc::clone(handler),
        Err(e) => return reply_error(state, client, Some(id), e).await,
    };

    let key = GroupKey::new(&body.service, &body.group);
    if !state.groups.lock().await.is_member(&key, &session_id) {
        let e = ServiceError::not_found(format!("not in group {key}"));
        return reply_error(state, client, Some(id), e).await;
    }
    let Some(ctx) = context(state, &session_id, client, &body.service).await else {
        return;
    };

    if let Err(e) = guarded(handler(ctx, body.group, body.data)).await {
        reply_error(state, client, Some(id), e).await;
    }
}

async fn authorize(
    state: &Arc<ServerState>,
    client: &Client,
    session_id: SessionId,
    id: u64,
    body: AuthorizeBody,
) {
    let handler = match lookup(state, &body.service).and_then(|s| {
        s.authorize().ok_or_else(|| {
            ServiceError::not_found(format!("service `{}` does not authorize", body.service))
        })
    }) {
        Ok(handler) => Arc::clone(handler),
        Err(e) => return reply_error(state, client, Some(id), e).await,
    };

    let Some(entry) = state
        .inflight
        .try_begin(InflightKey::authorize(client.id, &body.service))
    else {
        let e = ServiceError::conflict(format!(
            "authorize for `{}` already in progress",
            body.service
        ));
        return reply_error(state, client, Some(id), e).await;
    };
    let Some(ctx) = context(state, &session_id, client, &body.service).await else {
        return;
    };

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _entry = entry;
        match guarded(handler(ctx, body.data)).await {
            Ok(authorization) => {
                let mut sessions = state.sessions.lock().await;
                let Some(session) = sessions.get_mut(&session_id) else {
                    debug!(%session_id, "session gone before authorize completed");
                    return;
                };
                session.set_identity(&body.service, authorization.user);
                session.enqueue(OutboundBody::Response(ResponseBody {
                    request_id: id,
                    data: authorization.data,
                }));
            }
            Err(e) => emit(&state, &session_id, OutboundBody::Error(e.into_body(Some(id)))).await,
        }
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lookup<'a>(state: &'a ServerState, service: &str) -> Result<&'a Service, ServiceError> {
    state
        .services
        .get(service)
        .ok_or_else(|| ServiceError::not_found(format!("unknown service `{service}`")))
}

fn no_method(body: &RequestBody) -> ServiceError {
    ServiceError::not_found(format!(
        "service `{}` has no method `{}`",
        body.service, body.method
    ))
}

async fn context(
    state: &ServerState,
    session_id: &SessionId,
    client: &Client,
    service: &str,
) -> Option<ServiceContext> {
    let sessions = state.sessions.lock().await;
    let session = sessions.get(session_id)?;
    Some(build_context(state, session, session_id, client, service))
}

fn build_context(
    state: &ServerState,
    session: &tether_session::Session,
    session_id: &SessionId,
    client: &Client,
    service: &str,
) -> ServiceContext {
    ServiceContext::new(
        session_id.clone(),
        Some(client.id),
        session.identity(service).map(String::from),
        state.handle(service),
        session.subscribe(),
    )
}

/// Runs a handler on its own task. A panic is logged and becomes an
/// opaque 500.
pub(crate) fn guarded<T, F>(handler: F) -> impl Future<Output = Result<T, ServiceError>> + Send
where
    F: Future<Output = Result<T, ServiceError>> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::spawn(handler);
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "handler panicked");
                Err(ServiceError::internal())
            }
        }
    }
}

/// Enqueues a result on the session, wherever its client is now. If the
/// session is gone the result is dropped.
async fn emit(state: &ServerState, session_id: &SessionId, body: OutboundBody) {
    let mut sessions = state.sessions.lock().await;
    match sessions.get_mut(session_id) {
        Some(session) => {
            if session.is_idle() {
                trace!(%session_id, "client gone, result kept for resume");
            }
            session.enqueue(body);
        }
        None => debug!(%session_id, kind = ?body.kind(), "session gone, result dropped"),
    }
}

/// Sends an `error` frame: sequenced through the outbox when the client
/// has a session, straight to the socket when it does not.
pub(crate) async fn reply_error(
    state: &ServerState,
    client: &Client,
    request_id: Option<u64>,
    error: ServiceError,
) {
    let body = error.into_body(request_id);

    if let Some(session_id) = client.session_id() {
        let mut sessions = state.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.enqueue(OutboundBody::Error(body));
            return;
        }
    }

    if let Err(e) = send_unsequenced(&client.link, OutboundKind::Error, 0, Some(&body)) {
        trace!(client_id = %client.id, error = %e, "error frame not sent");
    }
}
