//! `TetherServer` builder, shared state and background loops.
//!
//! This is the entry point for running a Tether server. It ties together
//! all the layers: transport → protocol → session → group, plus the
//! timers that drive idle detection and the command loop services talk
//! to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tether_group::{GroupKey, GroupRegistry};
use tether_protocol::{ConnectionId, OutboundKind, close};
use tether_session::{SessionConfig, SessionId, SessionStore, send_unsequenced};
use tether_timeout::{Clock, ClockConfig, Expirations, TimeoutRegistry};
use tether_transport::{Transport, WebSocketTransport};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Client, handle_connection};
use crate::inflight::Inflight;
use crate::service::{Service, ServiceCommand, ServiceHandle};
use crate::{TetherError, dispatcher, lifecycle};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The three timers every connection and session runs on.
pub(crate) struct Timers {
    /// Per connection. Refreshed by every inbound frame.
    pub(crate) inbound_idle: TimeoutRegistry<ConnectionId, ()>,
    /// Per connection. Refreshed by every outbound frame.
    pub(crate) idle_output: TimeoutRegistry<ConnectionId, ()>,
    /// Per orphaned session: the resume grace period.
    pub(crate) closed_sessions: TimeoutRegistry<SessionId, ()>,
}

pub(crate) struct TimerStreams {
    inbound_idle: Expirations<ConnectionId, ()>,
    idle_output: Expirations<ConnectionId, ()>,
    closed_sessions: Expirations<SessionId, ()>,
}

impl Timers {
    fn new(config: &SessionConfig) -> (Self, TimerStreams) {
        let (inbound_idle, inbound_idle_rx) =
            TimeoutRegistry::new("inbound-idle", config.inbound_idle_timeout);
        let (idle_output, idle_output_rx) =
            TimeoutRegistry::new("idle-output", config.idle_output_interval);
        let (closed_sessions, closed_sessions_rx) =
            TimeoutRegistry::new("closed-sessions", config.closed_session_grace);
        (
            Self {
                inbound_idle,
                idle_output,
                closed_sessions,
            },
            TimerStreams {
                inbound_idle: inbound_idle_rx,
                idle_output: idle_output_rx,
                closed_sessions: closed_sessions_rx,
            },
        )
    }
}

/// Shared server state passed to each connection task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. When both
/// async locks are needed, `sessions` is taken before `groups`.
pub(crate) struct ServerState {
    pub(crate) sessions: Mutex<SessionStore>,
    pub(crate) groups: Mutex<GroupRegistry>,
    pub(crate) services: HashMap<String, Service>,
    pub(crate) inflight: Inflight,
    pub(crate) timers: Timers,
    clients: StdMutex<HashMap<ConnectionId, Arc<Client>>>,
    commands: mpsc::UnboundedSender<ServiceCommand>,
}

impl ServerState {
    /// Fresh state, plus the expiry streams and command queue the
    /// background loops consume.
    pub(crate) fn new(
        services: HashMap<String, Service>,
        config: &SessionConfig,
    ) -> (Self, TimerStreams, mpsc::UnboundedReceiver<ServiceCommand>) {
        let (timers, streams) = Timers::new(config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let state = Self {
            sessions: Mutex::new(SessionStore::new()),
            groups: Mutex::new(GroupRegistry::new()),
            services,
            inflight: Inflight::default(),
            timers,
            clients: StdMutex::new(HashMap::new()),
            commands: commands_tx,
        };
        (state, streams, commands_rx)
    }

    pub(crate) fn register_client(&self, client: Arc<Client>) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id, client);
    }

    pub(crate) fn remove_client(&self, id: ConnectionId) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub(crate) fn client(&self, id: ConnectionId) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub(crate) fn clients(&self) -> Vec<Arc<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// A command handle speaking for `service`.
    pub(crate) fn handle(&self, service: &str) -> ServiceHandle {
        ServiceHandle::new(service, self.commands.clone())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = TetherServer::builder()
///     .bind("0.0.0.0:8080")
///     .service(lobby)
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    session_config: SessionConfig,
    clock_config: ClockConfig,
    services: HashMap<String, Service>,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            session_config: SessionConfig::default(),
            clock_config: ClockConfig::default(),
            services: HashMap::new(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the session timeouts.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Sets the tick interval shared by every timeout.
    pub fn clock_config(mut self, config: ClockConfig) -> Self {
        self.clock_config = config;
        self
    }

    /// Registers a service. A later service with the same name replaces
    /// the earlier one.
    pub fn service(mut self, service: Service) -> Self {
        if let Some(previous) = self.services.insert(service.name().to_owned(), service) {
            warn!(service = previous.name(), "service registered twice, keeping the last");
        }
        self
    }

    /// Binds the transport and assembles the server.
    pub async fn build(self) -> Result<TetherServer, TetherError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let (state, streams, commands_rx) = ServerState::new(self.services, &self.session_config);
        let (shutdown, _) = watch::channel(false);

        Ok(TetherServer {
            transport,
            state: Arc::new(state),
            streams,
            commands: commands_rx,
            clock_config: self.clock_config,
            shutdown: Arc::new(shutdown),
        })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer {
    transport: WebSocketTransport,
    state: Arc<ServerState>,
    streams: TimerStreams,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    clock_config: ClockConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TetherServer {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// A handle for observing and stopping the server once it runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Runs the server until [`ServerHandle::shutdown`] is called.
    ///
    /// Starts the shared clock, the timer consumers and the service
    /// command loop, then accepts connections and spawns a task for
    /// each. On shutdown every live client is closed with the
    /// server-shutdown code and every orphaned session is destroyed.
    pub async fn run(self) -> Result<(), TetherError> {
        let TetherServer {
            mut transport,
            state,
            streams,
            commands,
            clock_config,
            shutdown,
        } = self;

        let mut clock = Clock::new(clock_config);
        clock.register(state.timers.inbound_idle.clone());
        clock.register(state.timers.idle_output.clone());
        clock.register(state.timers.closed_sessions.clone());

        let background: Vec<JoinHandle<()>> = vec![
            clock.spawn(),
            tokio::spawn(expire_inbound_idle(Arc::clone(&state), streams.inbound_idle)),
            tokio::spawn(expire_idle_output(Arc::clone(&state), streams.idle_output)),
            tokio::spawn(expire_closed_sessions(Arc::clone(&state), streams.closed_sessions)),
            tokio::spawn(command_loop(Arc::clone(&state), commands)),
        ];

        let mut stop = shutdown.subscribe();
        let stopped = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };
        tokio::pin!(stopped);
        info!(services = state.services.len(), "Tether server running");

        loop {
            tokio::select! {
                () = &mut stopped => break,
                accepted = transport.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(handle_connection(conn, Arc::clone(&state)));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        if let Err(e) = transport.shutdown().await {
            warn!(error = %e, "transport shutdown failed");
        }
        lifecycle::shutdown(&state).await;
        for task in background {
            task.abort();
        }
        info!("Tether server stopped");
        Ok(())
    }
}

/// A cloneable handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    /// Stops the accept loop and tears down every client and session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// A command handle for `service`, for code running outside any
    /// handler.
    pub fn service_handle(&self, service: &str) -> ServiceHandle {
        self.state.handle(service)
    }

    /// Number of live sessions, bound or orphaned.
    pub async fn session_count(&self) -> usize {
        self.state.sessions.lock().await.len()
    }

    /// Number of sessions waiting for a resume.
    pub async fn orphaned_count(&self) -> usize {
        self.state.sessions.lock().await.idle_ids().len()
    }

    /// Number of groups with at least one member.
    pub async fn group_count(&self) -> usize {
        self.state.groups.lock().await.group_count()
    }

    /// Identities currently in `service:group`.
    pub async fn group_users(&self, service: &str, group: &str) -> Vec<String> {
        self.state
            .groups
            .lock()
            .await
            .users(&GroupKey::new(service, group))
    }

    /// Number of requests, joins and authorizations still in flight.
    pub fn inflight_len(&self) -> usize {
        self.state.inflight.len()
    }

    /// Number of open connections.
    pub fn client_count(&self) -> usize {
        self.state.clients().len()
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Closes clients that went silent.
async fn expire_inbound_idle(state: Arc<ServerState>, mut expired: Expirations<ConnectionId, ()>) {
    while let Some(batch) = expired.recv().await {
        for (id, ()) in batch {
            if let Some(client) = state.client(id) {
                debug!(client_id = %id, "inbound idle timeout");
                client.close(close::CLIENT_TIMEOUT, "client timeout");
            }
        }
    }
}

/// Nudges clients nothing was sent to lately. Clients with a session get
/// their outbox replayed before the `sync`.
async fn expire_idle_output(state: Arc<ServerState>, mut expired: Expirations<ConnectionId, ()>) {
    while let Some(batch) = expired.recv().await {
        for (id, ()) in batch {
            let Some(client) = state.client(id) else {
                continue;
            };
            if client.is_closed() {
                continue;
            }
            match client.session_id() {
                Some(session_id) => dispatcher::resync(&state, &session_id).await,
                None => {
                    let sent = send_unsequenced::<()>(&client.link, OutboundKind::Sync, 0, None);
                    if let Err(e) = sent {
                        trace!(client_id = %id, error = %e, "idle sync not sent");
                    }
                }
            }
        }
    }
}

async fn expire_closed_sessions(state: Arc<ServerState>, mut expired: Expirations<SessionId, ()>) {
    while let Some(batch) = expired.recv().await {
        let ids = batch.into_iter().map(|(id, ())| id).collect();
        lifecycle::expire_sessions(&state, ids).await;
    }
}

/// Applies what services asked for through their [`ServiceHandle`]s.
async fn command_loop(
    state: Arc<ServerState>,
    mut commands: mpsc::UnboundedReceiver<ServiceCommand>,
) {
    while let Some(command) = commands.recv().await {
        trace!(?command, "service command");
        apply(&state, command).await;
    }
}

async fn apply(state: &ServerState, command: ServiceCommand) {
    if let ServiceCommand::Logout { session } = command {
        lifecycle::logout(state, &session).await;
        return;
    }

    let mut sessions = state.sessions.lock().await;
    let mut groups = state.groups.lock().await;
    let result = match command {
        ServiceCommand::JoinGroup {
            service,
            group,
            session,
            user,
        } => {
            if !sessions.contains(&session) {
                debug!(%session, service, group, "join for unknown session ignored");
                return;
            }
            groups.join(&GroupKey::new(service, group), &session, &user, None)
        }
        ServiceCommand::LeaveGroup {
            service,
            group,
            session,
        } => groups.leave(&GroupKey::new(service, group), &session),
        ServiceCommand::CloseGroup { service, group } => {
            groups.close(&GroupKey::new(service, group))
        }
        ServiceCommand::Event {
            service,
            group,
            recipient,
            kind,
            data,
        } => groups.event(&GroupKey::new(service, group), &recipient, &kind, data),
        ServiceCommand::Logout { .. } => return,
    };

    match result {
        Ok(deliveries) => lifecycle::deliver(&mut sessions, deliveries),
        Err(e) => debug!(error = %e, "service command had no effect"),
    }
}
