//! ACP implementation of [`AgentTransport`].
//!
//! Wires the process host, the RPC connection, the permission broker, the
//! capability servicer and the session router into one session.
//!
//! # Session lifecycle
//!
//! 1. [`AcpTransport::connect`] emits `connecting`, spawns the agent, starts
//!    the connection and registers every inbound handler.
//! 2. `initialize`, then `session/new` (or `session/load` when resuming).
//! 3. Status becomes `connected`; a router pump turns the shared
//!    [`SessionSignal`] broadcast into [`TransportEvent`]s and a supervisor
//!    waits for the agent to go away.
//! 4. An unexpected exit moves status to `error`, fails pending calls,
//!    cancels permission requests and sweeps terminals. [`dispose`] does the
//!    same teardown on purpose and ends in `disconnected`.
//!
//! [`dispose`]: AgentTransport::dispose

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::connection::RpcConnection;
use crate::acp::handshake;
use crate::acp::spawner::{spawn_agent, AgentProcessHandle, SpawnConfig};
use crate::broker::PermissionBroker;
use crate::config::GlobalConfig;
use crate::driver::{
    run_router_pump, AgentTransport, StatusCell, TakeOnce, TransportCommand, TransportEvent,
    TransportFuture,
};
use crate::models::permission::{PermissionOutcome, PermissionRequest};
use crate::models::session::{
    ClientCapabilities, NegotiatedCapabilities, SessionHandle, TransportStatus,
};
use crate::models::update::SessionNotification;
use crate::router::{SessionRouter, SessionSignal};
use crate::servicer::CapabilityServicer;
use crate::traffic::TrafficLog;
use crate::{AppError, Result};

/// Capacity of the session signal broadcast. Replay on `session/load` can be
/// long, and the router pump only subscribes once.
const SIGNAL_CAPACITY: usize = 4096;

/// Everything needed to open one ACP session.
#[derive(Debug, Clone)]
pub struct AcpTransportConfig {
    /// How to launch the agent.
    pub spawn: SpawnConfig,
    /// Capabilities offered to the agent.
    pub client: ClientCapabilities,
    /// Session to resume instead of creating a new one.
    pub resume: Option<String>,
    /// SIGTERM-to-kill grace period on dispose.
    pub grace: Duration,
    /// Upper bound on the `initialize` exchange.
    pub initialize_timeout: Duration,
    /// Traffic log destination.
    pub traffic_log: Option<PathBuf>,
}

impl AcpTransportConfig {
    /// Build from the global configuration and a profile name.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if `agent` names no profile.
    pub fn from_global(config: &GlobalConfig, agent: &str, cwd: PathBuf) -> Result<Self> {
        let profile = config.agent(agent)?;
        Ok(Self {
            spawn: SpawnConfig::from_profile(agent, profile, cwd),
            client: config.client,
            resume: None,
            grace: config.timeouts.grace(),
            initialize_timeout: config.timeouts.initialize(),
            traffic_log: config.logging.traffic_log.clone(),
        })
    }
}

/// One ACP session with a spawned agent process.
pub struct AcpTransport {
    session: SessionHandle,
    mode: Arc<watch::Sender<Option<String>>>,
    connection: RpcConnection,
    process: AgentProcessHandle,
    broker: PermissionBroker,
    servicer: CapabilityServicer,
    status: StatusCell,
    events: TakeOnce<mpsc::UnboundedReceiver<TransportEvent>>,
    signals: broadcast::Sender<SessionSignal>,
    traffic: TrafficLog,
    grace: Duration,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for AcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpTransport")
            .field("session_id", &self.session.session_id)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

/// Pieces that exist once the channel is up, before the session is.
struct Wiring {
    connection: RpcConnection,
    broker: PermissionBroker,
    servicer: CapabilityServicer,
    signals: broadcast::Sender<SessionSignal>,
}

impl AcpTransport {
    /// Spawn the agent and establish a session.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] if the agent cannot be started.
    /// - [`AppError::Protocol`] if the handshake is refused or times out.
    /// - Any failure of `initialize`, `session/new` or `session/load`.
    ///
    /// On error the agent process has already been terminated.
    pub async fn connect(config: AcpTransportConfig) -> Result<Self> {
        let label = config.spawn.label.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = StatusCell::connecting(events_tx.clone());

        let traffic = match &config.traffic_log {
            Some(path) => TrafficLog::open(&label, path).await?,
            None => TrafficLog::disabled(&label),
        };

        let process = match spawn_agent(&config.spawn, traffic.clone()).await {
            Ok(process) => process,
            Err(err) => {
                status.set(TransportStatus::Error);
                traffic.close().await;
                return Err(err);
            }
        };
        let handle = process.handle.clone();

        let connection = RpcConnection::start(&label, process.stdout, process.stdin, traffic.clone());
        let wiring = Self::wire(connection, config.client).await;
        let signals_rx = wiring.signals.subscribe();

        let session = match Self::establish(&wiring.connection, &config).await {
            Ok(session) => session,
            Err(err) => {
                warn!(agent = %label, %err, "session setup failed, stopping agent");
                wiring.connection.close(&format!("setup failed: {err}")).await;
                wiring.servicer.release_all().await;
                handle.terminate(config.grace).await;
                status.set(TransportStatus::Error);
                traffic.close().await;
                return Err(err);
            }
        };

        let mut router = SessionRouter::new(&session.session_id);
        router.add_alias(&session.resolved_session_id);
        let mode = Arc::new(watch::channel(session.current_mode.clone()).0);
        let shutdown = CancellationToken::new();

        status.set(TransportStatus::Connected);
        tokio::spawn(run_router_pump(
            router,
            signals_rx,
            events_tx,
            Arc::clone(&mode),
            shutdown.clone(),
        ));
        info!(
            agent = %label,
            session_id = %session.session_id,
            pid = handle.pid(),
            "acp session connected"
        );

        tokio::spawn(supervise(
            handle.clone(),
            wiring.connection.clone(),
            wiring.broker.clone(),
            wiring.servicer.clone(),
            status.clone(),
            traffic.clone(),
            config.grace,
            shutdown.clone(),
        ));

        Ok(Self {
            session,
            mode,
            connection: wiring.connection,
            process: handle,
            broker: wiring.broker,
            servicer: wiring.servicer,
            status,
            events: TakeOnce::new("transport event sequence", events_rx),
            signals: wiring.signals,
            traffic,
            grace: config.grace,
            shutdown,
            disposed: AtomicBool::new(false),
        })
    }

    /// Register inbound handlers on a fresh connection.
    async fn wire(connection: RpcConnection, client: ClientCapabilities) -> Wiring {
        let broker = PermissionBroker::new();
        let servicer = CapabilityServicer::new(client);
        servicer.register(&connection).await;

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        let update_tx = signals.clone();
        connection
            .on_notification("session/update", move |params| {
                let update_tx = update_tx.clone();
                async move {
                    match SessionNotification::from_params(params) {
                        Ok(notification) => {
                            // No receiver only means nobody listens yet.
                            let _ = update_tx.send(SessionSignal::Update(notification));
                        }
                        Err(err) => warn!(%err, "undecodable session/update, dropping"),
                    }
                }
            })
            .await;

        let permission_broker = broker.clone();
        connection
            .on_request("session/request_permission", move |params| {
                let broker = permission_broker.clone();
                async move { request_permission(&broker, &params).await }
            })
            .await;

        Wiring {
            connection,
            broker,
            servicer,
            signals,
        }
    }

    async fn establish(
        connection: &RpcConnection,
        config: &AcpTransportConfig,
    ) -> Result<SessionHandle> {
        let capabilities =
            tokio::time::timeout(config.initialize_timeout, connection.initialize(config.client))
                .await
                .map_err(|_| {
                    AppError::Protocol(format!(
                        "initialize timed out after {:?}",
                        config.initialize_timeout
                    ))
                })??;

        match &config.resume {
            Some(session_id) => {
                handshake::load_session(connection, session_id, &config.spawn.cwd, capabilities)
                    .await
            }
            None => handshake::new_session(connection, &config.spawn.cwd, capabilities).await,
        }
    }

    /// Underlying RPC connection.
    #[must_use]
    pub fn connection(&self) -> &RpcConnection {
        &self.connection
    }

    /// Agent process handle.
    #[must_use]
    pub fn process(&self) -> &AgentProcessHandle {
        &self.process
    }

    /// Capability servicer (terminal table, file access).
    #[must_use]
    pub fn servicer(&self) -> &CapabilityServicer {
        &self.servicer
    }

    /// Full session handle as established.
    #[must_use]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.status.get() {
            TransportStatus::Connected => Ok(()),
            other => Err(AppError::ConnectionClosed(format!("transport is {other}"))),
        }
    }

    fn start_prompt(&self, text: String) -> Result<()> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidParams("prompt must not be empty".into()));
        }
        let connection = self.connection.clone();
        let signals = self.signals.clone();
        let session_id = self.session.resolved_session_id.clone();
        let params = handshake::prompt_params(&session_id, &text);

        tokio::spawn(async move {
            let signal = match connection.call("session/prompt", params).await {
                Ok(result) => SessionSignal::TurnEnded {
                    stop_reason: handshake::stop_reason(&result),
                    session_id,
                },
                Err(err) => {
                    warn!(session_id = %session_id, %err, "prompt failed");
                    SessionSignal::TurnFailed {
                        message: err.to_string(),
                        session_id,
                    }
                }
            };
            let _ = signals.send(signal);
        });
        Ok(())
    }

    async fn cancel_turn(&self) -> Result<()> {
        let session_id = &self.session.resolved_session_id;
        self.connection
            .notify("session/cancel", handshake::cancel_params(session_id))
            .await?;
        self.broker.cancel_all("turn cancelled").await;
        debug!(session_id = %session_id, "cancel sent");
        Ok(())
    }

    async fn set_mode(&self, mode_id: String) -> Result<()> {
        let session_id = &self.session.resolved_session_id;
        self.connection
            .call(
                "session/set_mode",
                handshake::set_mode_params(session_id, &mode_id),
            )
            .await?;
        info!(session_id = %session_id, mode_id = %mode_id, "session mode set");
        self.mode.send_replace(Some(mode_id));
        Ok(())
    }
}

impl AgentTransport for AcpTransport {
    fn take_events(&self) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>>> {
        Box::pin(self.events.take())
    }

    fn take_permission_requests(
        &self,
    ) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<PermissionRequest>>> {
        Box::pin(self.broker.take_requests())
    }

    fn permissions(&self) -> &PermissionBroker {
        &self.broker
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn session_id(&self) -> &str {
        &self.session.session_id
    }

    fn resolved_session_id(&self) -> &str {
        &self.session.resolved_session_id
    }

    fn capabilities(&self) -> &NegotiatedCapabilities {
        &self.session.capabilities
    }

    fn current_mode(&self) -> Option<String> {
        self.mode.borrow().clone()
    }

    fn send(&self, command: TransportCommand) -> TransportFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_connected()?;
            match command {
                TransportCommand::Prompt { text } => self.start_prompt(text),
                TransportCommand::Cancel => self.cancel_turn().await,
                TransportCommand::SetMode { mode_id } => self.set_mode(mode_id).await,
            }
        })
    }

    fn dispose(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shutdown.cancel();
            self.broker.cancel_all("transport disposed").await;
            self.connection.close("transport disposed").await;
            self.servicer.release_all().await;
            let exit = self.process.terminate(self.grace).await;
            self.status.set(TransportStatus::Disconnected);
            self.traffic.close().await;
            info!(session_id = %self.session.session_id, %exit, "acp transport disposed");
        })
    }
}

/// Handle `session/request_permission`: park until the broker resolves it.
async fn request_permission(broker: &PermissionBroker, params: &Value) -> Result<Value> {
    let request = PermissionRequest::from_params(params)?;
    let options = request.options.clone();
    let outcome = broker
        .submit(request)
        .await
        .await
        .unwrap_or(PermissionOutcome::Cancelled);
    Ok(outcome.to_response(&options))
}

/// Wait for the agent to go away on its own and tear the session down.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    process: AgentProcessHandle,
    connection: RpcConnection,
    broker: PermissionBroker,
    servicer: CapabilityServicer,
    status: StatusCell,
    traffic: TrafficLog,
    grace: Duration,
    shutdown: CancellationToken,
) {
    let reason = tokio::select! {
        biased;
        () = shutdown.cancelled() => return,
        exit = process.wait_exit() => format!("agent exited: {exit}"),
        reason = connection.closed() => format!("connection closed: {reason}"),
    };

    warn!(%reason, "agent session ended unexpectedly");
    connection.close(&reason).await;
    broker.cancel_all(&reason).await;
    servicer.release_all().await;
    process.terminate(grace).await;
    status.set(TransportStatus::Error);
    traffic.flush().await;
}
