//! In-process implementation of [`AgentTransport`].
//!
//! A [`LocalAgent`] is an object living in this process rather than a child
//! speaking ACP. It reports progress through a [`LocalContext`], which feeds
//! the same session broadcast, router and permission broker the ACP transport
//! uses, so the view layer cannot tell the two apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::PermissionBroker;
use crate::driver::{
    run_router_pump, AgentTransport, StatusCell, TakeOnce, TransportCommand, TransportEvent,
    TransportFuture,
};
use crate::models::permission::{PermissionOutcome, PermissionRequest};
use crate::models::session::{NegotiatedCapabilities, TransportStatus};
use crate::models::update::{SessionNotification, SessionUpdate};
use crate::router::{SessionRouter, SessionSignal};
use crate::{AppError, Result};

const SIGNAL_CAPACITY: usize = 1024;

/// Agent implemented in-process.
pub trait LocalAgent: Send + Sync + 'static {
    /// Capabilities reported to the view layer.
    fn capabilities(&self) -> NegotiatedCapabilities {
        NegotiatedCapabilities {
            protocol_version: crate::acp::handshake::PROTOCOL_VERSION,
            ..NegotiatedCapabilities::default()
        }
    }

    /// Run one turn and return its stop reason.
    ///
    /// # Errors
    ///
    /// An error ends the turn and surfaces as [`TransportEvent::Error`].
    fn prompt<'a>(&'a self, ctx: &'a LocalContext, text: String)
        -> TransportFuture<'a, Result<String>>;

    /// Stop the current turn. The default does nothing.
    fn cancel(&self) -> TransportFuture<'_, ()> {
        Box::pin(async {})
    }

    /// Switch mode. The default accepts any mode.
    ///
    /// # Errors
    ///
    /// Implementations reject unknown modes.
    fn set_mode<'a>(&'a self, mode_id: &'a str) -> TransportFuture<'a, Result<()>> {
        let _ = mode_id;
        Box::pin(async { Ok(()) })
    }
}

/// Handle through which a [`LocalAgent`] reports progress.
#[derive(Debug, Clone)]
pub struct LocalContext {
    session_id: String,
    signals: broadcast::Sender<SessionSignal>,
    broker: PermissionBroker,
}

impl LocalContext {
    /// Session the agent is serving.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a session update.
    pub fn update(&self, update: SessionUpdate) {
        let _ = self.signals.send(SessionSignal::Update(SessionNotification {
            session_id: self.session_id.clone(),
            update,
        }));
    }

    /// Ask for permission and wait for the decision.
    pub async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome {
        self.broker
            .submit(request)
            .await
            .await
            .unwrap_or(PermissionOutcome::Cancelled)
    }
}

/// Transport over a [`LocalAgent`].
pub struct LocalTransport {
    agent: Arc<dyn LocalAgent>,
    context: LocalContext,
    capabilities: NegotiatedCapabilities,
    mode: Arc<watch::Sender<Option<String>>>,
    status: StatusCell,
    events: TakeOnce<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("session_id", &self.context.session_id)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    /// Open a session with `agent`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(agent: Arc<dyn LocalAgent>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = StatusCell::connecting(events_tx.clone());

        let session_id = Uuid::new_v4().to_string();
        let (signals, signals_rx) = broadcast::channel(SIGNAL_CAPACITY);
        let context = LocalContext {
            session_id: session_id.clone(),
            signals,
            broker: PermissionBroker::new(),
        };
        let mode = Arc::new(watch::channel(None).0);
        let shutdown = CancellationToken::new();

        status.set(TransportStatus::Connected);
        tokio::spawn(run_router_pump(
            SessionRouter::new(&session_id),
            signals_rx,
            events_tx,
            Arc::clone(&mode),
            shutdown.clone(),
        ));
        info!(session_id, "local session connected");

        Self {
            capabilities: agent.capabilities(),
            agent,
            context,
            mode,
            status,
            events: TakeOnce::new("transport event sequence", events_rx),
            shutdown,
            disposed: AtomicBool::new(false),
        }
    }

    fn start_prompt(&self, text: String) -> Result<()> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidParams("prompt must not be empty".into()));
        }
        let agent = Arc::clone(&self.agent);
        let ctx = self.context.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => return,
                outcome = agent.prompt(&ctx, text) => outcome,
            };
            let signal = match outcome {
                Ok(stop_reason) => SessionSignal::TurnEnded {
                    session_id: ctx.session_id.clone(),
                    stop_reason,
                },
                Err(err) => {
                    warn!(session_id = %ctx.session_id, %err, "local prompt failed");
                    SessionSignal::TurnFailed {
                        session_id: ctx.session_id.clone(),
                        message: err.to_string(),
                    }
                }
            };
            let _ = ctx.signals.send(signal);
        });
        Ok(())
    }
}

impl AgentTransport for LocalTransport {
    fn take_events(&self) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>>> {
        Box::pin(self.events.take())
    }

    fn take_permission_requests(
        &self,
    ) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<PermissionRequest>>> {
        Box::pin(self.context.broker.take_requests())
    }

    fn permissions(&self) -> &PermissionBroker {
        &self.context.broker
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn session_id(&self) -> &str {
        &self.context.session_id
    }

    fn resolved_session_id(&self) -> &str {
        &self.context.session_id
    }

    fn capabilities(&self) -> &NegotiatedCapabilities {
        &self.capabilities
    }

    fn current_mode(&self) -> Option<String> {
        self.mode.borrow().clone()
    }

    fn send(&self, command: TransportCommand) -> TransportFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.status.get() != TransportStatus::Connected {
                return Err(AppError::ConnectionClosed(format!(
                    "transport is {}",
                    self.status.get()
                )));
            }
            match command {
                TransportCommand::Prompt { text } => self.start_prompt(text),
                TransportCommand::Cancel => {
                    self.agent.cancel().await;
                    self.context.broker.cancel_all("turn cancelled").await;
                    Ok(())
                }
                TransportCommand::SetMode { mode_id } => {
                    self.agent.set_mode(&mode_id).await?;
                    self.mode.send_replace(Some(mode_id));
                    Ok(())
                }
            }
        })
    }

    fn dispose(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shutdown.cancel();
            self.context.broker.cancel_all("transport disposed").await;
            self.status.set(TransportStatus::Disconnected);
            debug!(session_id = %self.context.session_id, "local transport disposed");
        })
    }
}
