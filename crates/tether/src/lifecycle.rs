//! Connection lifecycle: binding sockets to sessions and deciding what
//! happens to a session when its socket goes away.
//!
//! ```text
//!             open ──→ new session, bound
//!   client ──{
//!             resume ──→ existing session, rebound, outbox replayed
//!
//!   close ──→ classify(code)
//!               ├─ Resumable → orphan the session, start the grace timer
//!               └─ Terminal  → destroy the session now
//! ```

use std::sync::Arc;

use tether_group::{Delivery, GroupRegistry};
use tether_protocol::close::{self, CloseDisposition};
use tether_protocol::{ErrorCode, OpenBody, PROTOCOL_VERSION, ResumeBody, SessionBody};
use tether_session::{SessionId, SessionStore};
use tracing::{debug, error, info, trace, warn};

use crate::connection::Client;
use crate::server::ServerState;
use crate::service::Service;
use crate::{ServiceContext, ServiceError, dispatcher};

/// A session's exit from one group, for the service's leave hook.
pub(crate) struct Departure {
    group: String,
    ctx: ServiceContext,
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// `open {version}`: creates a session for `client` and replies with its
/// id and the negotiated version.
pub(crate) async fn open(state: &ServerState, client: &Client, body: OpenBody) {
    if body.version == 0 {
        dispatcher::reply_error(
            state,
            client,
            None,
            ServiceError::precondition_failed("unsupported protocol version 0"),
        )
        .await;
        return;
    }
    let version = body.version.min(PROTOCOL_VERSION);

    let mut sessions = state.sessions.lock().await;
    let session = sessions.create(client.link.clone());
    let session_id = session.id().clone();
    client.bind_session(session_id.clone());
    client.set_version(version);

    let reply = SessionBody {
        session_id: Some(session_id.to_string()),
        version: Some(version),
        ack: None,
    };
    if let Err(e) = session.send_session(&reply) {
        debug!(client_id = %client.id, error = %e, "session reply not sent");
    }
    info!(
        client_id = %client.id,
        %session_id,
        version,
        addr = ?client.peer.addr,
        "session opened"
    );
}

/// `resume {sessionId}` with the client's last seen server id as `ack`.
///
/// Every rejection looks the same (401), whether the session is unknown
/// or the ack is out of range.
pub(crate) async fn resume(state: &ServerState, client: &Client, body: ResumeBody, ack: u64) {
    let session_id = SessionId::from(body.session_id);
    let mut sessions = state.sessions.lock().await;

    let session = match sessions.require(&session_id) {
        Ok(session) if session.accepts_resume_ack(ack) => session,
        rejected => {
            let reason = rejected
                .err()
                .map_or_else(|| "ack out of range".to_owned(), |e| e.to_string());
            drop(sessions);
            debug!(client_id = %client.id, ack, reason, "resume rejected");
            dispatcher::reply_error(state, client, None, ErrorCode::Unauthorized.into()).await;
            return;
        }
    };

    if state.timers.closed_sessions.delete(&session_id).is_none() {
        // Not orphaned: a live connection still holds the session.
        if let Some(previous) = session.client() {
            let replaced = match state.client(previous.id()) {
                Some(previous) => previous.close(close::SESSION_REPLACED, "session replaced"),
                None => previous.close(close::SESSION_REPLACED, "session replaced").is_ok(),
            };
            debug!(%session_id, previous = %previous.id(), replaced, "previous client replaced");
        }
    }

    session.purge(ack);
    session.bind(client.link.clone());
    client.bind_session(session_id.clone());
    let replayed = session.replay();

    let reply = SessionBody {
        session_id: None,
        version: None,
        ack: Some(ack),
    };
    if let Err(e) = session.send_session(&reply) {
        debug!(client_id = %client.id, error = %e, "session reply not sent");
    }
    info!(client_id = %client.id, %session_id, ack, replayed, "session resumed");
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Runs once per client, after its reader loop ends.
pub(crate) async fn client_closed(state: &ServerState, client: &Client) {
    let code = client.close_code().unwrap_or(close::ABNORMAL);
    state.remove_client(client.id);

    let Some(session_id) = client.session_id() else {
        forget_timers(state, client);
        debug!(client_id = %client.id, code, "client closed before opening a session");
        return;
    };

    let mut sessions = state.sessions.lock().await;
    let unbound = sessions
        .get_mut(&session_id)
        .is_some_and(|s| s.unbind(client.id));
    forget_timers(state, client);
    if !unbound {
        debug!(client_id = %client.id, %session_id, code, "session already moved on");
        return;
    }

    match close::classify(code) {
        CloseDisposition::Resumable => {
            state.timers.closed_sessions.add(session_id.clone(), ());
            info!(
                client_id = %client.id,
                %session_id,
                code,
                version = ?client.version(),
                "client lost, session awaiting resume"
            );
        }
        CloseDisposition::Terminal => {
            let mut groups = state.groups.lock().await;
            let departures = destroy_session(
                state,
                &mut sessions,
                &mut groups,
                &session_id,
                "closed for good",
            );
            drop(groups);
            drop(sessions);
            run_leave_hooks(state, departures).await;
        }
    }
}

fn forget_timers(state: &ServerState, client: &Client) {
    state.timers.inbound_idle.delete(&client.id);
    state.timers.idle_output.delete(&client.id);
}

/// Removes a session and every group membership it held.
///
/// The caller holds both locks and must run the returned departures
/// through [`run_leave_hooks`] after releasing them.
///
/// # Panics
/// If the session is still a member of any group afterwards.
pub(crate) fn destroy_session(
    state: &ServerState,
    sessions: &mut SessionStore,
    groups: &mut GroupRegistry,
    session_id: &SessionId,
    reason: &str,
) -> Vec<Departure> {
    state.timers.closed_sessions.delete(session_id);
    let Some(session) = sessions.remove(session_id) else {
        return Vec::new();
    };

    let mut departures = Vec::new();
    for key in groups.groups_of(session_id) {
        match groups.leave(&key, session_id) {
            // The departing session is gone, so its own `leave`
            // confirmation is skipped by `deliver`.
            Ok(deliveries) => deliver(sessions, deliveries),
            Err(e) => error!(%session_id, %key, error = %e, "leave during destroy failed"),
        }
        let ctx = ServiceContext::new(
            session_id.clone(),
            None,
            session.identity(&key.service).map(String::from),
            state.handle(&key.service),
            session.subscribe(),
        );
        departures.push(Departure {
            group: key.group,
            ctx,
        });
    }

    let remaining = groups.groups_of(session_id);
    assert!(
        remaining.is_empty(),
        "destroyed session {session_id} is still in groups {remaining:?}"
    );

    info!(%session_id, reason, groups = departures.len(), "session destroyed");
    departures
}

/// Calls each service's leave hook for a destroyed session's groups.
pub(crate) async fn run_leave_hooks(state: &ServerState, departures: Vec<Departure>) {
    for Departure { group, ctx } in departures {
        let service = ctx.handle().service().to_owned();
        let Some(hook) = state.services.get(&service).and_then(Service::leave) else {
            continue;
        };
        if let Err(e) = dispatcher::guarded(hook(ctx, group.clone())).await {
            warn!(service, group, error = %e, "leave hook failed");
        }
    }
}

/// Ends a session for good: closes its live client with the logout code,
/// or destroys it directly when it has none.
pub(crate) async fn logout(state: &ServerState, session_id: &SessionId) {
    let mut sessions = state.sessions.lock().await;
    let Some(session) = sessions.get(session_id) else {
        debug!(%session_id, "logout for unknown session");
        return;
    };

    if let Some(client) = session.client().and_then(|link| state.client(link.id())) {
        if client.close(close::LOGOUT, "logout") {
            // The client's teardown destroys the session.
            return;
        }
    }

    let mut groups = state.groups.lock().await;
    let departures = destroy_session(state, &mut sessions, &mut groups, session_id, "logout");
    drop(groups);
    drop(sessions);
    run_leave_hooks(state, departures).await;
}

/// Destroys every session whose grace period ran out without a resume.
pub(crate) async fn expire_sessions(state: &ServerState, expired: Vec<SessionId>) {
    let mut sessions = state.sessions.lock().await;
    let mut groups = state.groups.lock().await;
    let mut departures = Vec::new();
    for session_id in expired {
        if !sessions.get(&session_id).is_some_and(|s| s.is_idle()) {
            continue;
        }
        departures.extend(destroy_session(
            state,
            &mut sessions,
            &mut groups,
            &session_id,
            "grace period elapsed",
        ));
    }
    drop(groups);
    drop(sessions);
    run_leave_hooks(state, departures).await;
}

/// Enqueues each delivery on its session. Deliveries to sessions that no
/// longer exist are dropped.
pub(crate) fn deliver(sessions: &mut SessionStore, deliveries: Vec<Delivery>) {
    for Delivery { to, body } in deliveries {
        match sessions.get_mut(&to) {
            Some(session) => {
                session.enqueue(body);
            }
            None => trace!(session_id = %to, kind = ?body.kind(), "delivery skipped, session gone"),
        }
    }
}

/// Closes every client and destroys every orphaned session.
pub(crate) async fn shutdown(state: &Arc<ServerState>) {
    let clients = state.clients();
    info!(clients = clients.len(), "shutting down");
    for client in clients {
        client.close(close::SERVER_SHUTDOWN, "server shutdown");
    }

    let mut sessions = state.sessions.lock().await;
    let mut groups = state.groups.lock().await;
    let mut departures = Vec::new();
    for session_id in sessions.idle_ids() {
        departures.extend(destroy_session(
            state,
            &mut sessions,
            &mut groups,
            &session_id,
            "server shutdown",
        ));
    }
    drop(groups);
    drop(sessions);
    run_leave_hooks(state, departures).await;
}
