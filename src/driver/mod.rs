//! Transport facade.
//!
//! The [`AgentTransport`] trait is the only surface the view layer sees: a
//! single-consumer event sequence, a command sink, a status signal and the
//! permission broker. Implementations hide whether the agent is a child
//! process speaking ACP over stdio ([`acp_driver::AcpTransport`]) or an
//! in-process object ([`local_driver::LocalTransport`]).

pub mod acp_driver;
pub mod local_driver;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::PermissionBroker;
use crate::models::permission::PermissionRequest;
use crate::models::session::{NegotiatedCapabilities, TransportStatus};
use crate::models::tool_call::{ToolCallRecord, ToolCallStatus};
use crate::models::update::{AvailableCommand, PlanEntry};
use crate::router::{ConversationId, SessionRouter, SessionSignal};
use crate::{AppError, Result};

/// Commands accepted by [`AgentTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Start a turn with a plain-text prompt.
    Prompt {
        /// Prompt text.
        text: String,
    },
    /// Ask the agent to stop the current turn.
    Cancel,
    /// Switch the session mode.
    SetMode {
        /// Target mode id.
        mode_id: String,
    },
}

/// Events delivered to the view layer, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport status changed.
    Status(TransportStatus),
    /// Assistant output text.
    Text {
        /// Receiving conversation.
        conversation: ConversationId,
        /// Text chunk.
        text: String,
    },
    /// Assistant reasoning text.
    Thought {
        /// Receiving conversation.
        conversation: ConversationId,
        /// Text chunk.
        text: String,
    },
    /// Replayed user text (session resume).
    UserText {
        /// Receiving conversation.
        conversation: ConversationId,
        /// Text chunk.
        text: String,
    },
    /// A tool call was announced.
    ToolCall {
        /// Conversation the call was issued from.
        conversation: ConversationId,
        /// Full record.
        call: ToolCallRecord,
    },
    /// A tool call changed; `call` is the merged record.
    ToolCallUpdated {
        /// Receiving conversation.
        conversation: ConversationId,
        /// Merged record.
        call: ToolCallRecord,
    },
    /// The execution plan was replaced.
    Plan {
        /// Plan entries.
        entries: Vec<PlanEntry>,
    },
    /// The session mode changed.
    ModeChanged {
        /// New mode id.
        mode_id: String,
    },
    /// The agent's slash commands changed.
    AvailableCommands {
        /// Commands now available.
        commands: Vec<AvailableCommand>,
    },
    /// A tool call spawned a sub-agent conversation.
    SubagentStarted {
        /// The new conversation.
        conversation: ConversationId,
        /// Conversation the spawning call belongs to.
        parent: ConversationId,
        /// Spawning tool call.
        tool_call_id: String,
        /// Spawning tool call title.
        title: String,
    },
    /// A sub-agent's spawning tool call reached a terminal status.
    SubagentFinished {
        /// The sub-agent conversation.
        conversation: ConversationId,
        /// Spawning tool call.
        tool_call_id: String,
        /// `completed` or `failed`.
        status: ToolCallStatus,
    },
    /// The current turn ended.
    TurnComplete {
        /// Agent stop reason.
        stop_reason: String,
    },
    /// A non-fatal failure the view should surface.
    Error {
        /// Description.
        message: String,
    },
}

/// Boxed future returned by [`AgentTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The view layer's interface to one agent session.
///
/// A transport serves exactly one session; a new session needs a new
/// instance.
pub trait AgentTransport: Send + Sync {
    /// Take the event sequence. Events emitted before the first take are
    /// buffered.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AlreadyConsumed`] on the second call.
    fn take_events(&self) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<TransportEvent>>>;

    /// Take the sequence of permission requests awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AlreadyConsumed`] on the second call.
    fn take_permission_requests(
        &self,
    ) -> TransportFuture<'_, Result<mpsc::UnboundedReceiver<PermissionRequest>>>;

    /// Broker used to resolve permission requests.
    fn permissions(&self) -> &PermissionBroker;

    /// Status signal.
    fn status(&self) -> watch::Receiver<TransportStatus>;

    /// Session id assigned at creation.
    fn session_id(&self) -> &str;

    /// Session id to use when resuming.
    fn resolved_session_id(&self) -> &str;

    /// Capabilities negotiated with the agent.
    fn capabilities(&self) -> &NegotiatedCapabilities;

    /// Currently active session mode.
    fn current_mode(&self) -> Option<String>;

    /// Deliver a command.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] once the session has ended, or
    /// the failure of the underlying request for synchronous commands.
    fn send(&self, command: TransportCommand) -> TransportFuture<'_, Result<()>>;

    /// Release the connection and the agent. Idempotent.
    fn dispose(&self) -> TransportFuture<'_, ()>;
}

// ── Shared plumbing ──────────────────────────────────────────────────────────

/// Status signal that only accepts legal transitions and mirrors every
/// accepted change onto the event sequence.
#[derive(Debug, Clone)]
pub(crate) struct StatusCell {
    tx: Arc<watch::Sender<TransportStatus>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl StatusCell {
    /// Start in `connecting` and emit the first status event.
    pub(crate) fn connecting(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (tx, _) = watch::channel(TransportStatus::Connecting);
        let _ = events.send(TransportEvent::Status(TransportStatus::Connecting));
        Self {
            tx: Arc::new(tx),
            events,
        }
    }

    /// Move to `next` if legal. Returns whether the status changed.
    pub(crate) fn set(&self, next: TransportStatus) -> bool {
        // Emitting inside the closure keeps event order equal to watch order.
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "transport status changed");
                *current = next;
                let _ = self.events.send(TransportEvent::Status(next));
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn get(&self) -> TransportStatus {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.tx.subscribe()
    }
}

/// Single-consumer slot for a receiver.
#[derive(Debug)]
pub(crate) struct TakeOnce<T> {
    label: &'static str,
    slot: Mutex<Option<T>>,
}

impl<T> TakeOnce<T> {
    pub(crate) fn new(label: &'static str, value: T) -> Self {
        Self {
            label,
            slot: Mutex::new(Some(value)),
        }
    }

    pub(crate) async fn take(&self) -> Result<T> {
        self.slot
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::AlreadyConsumed(self.label.to_owned()))
    }
}

/// Feed broadcast signals through the router onto the event sequence.
pub(crate) async fn run_router_pump(
    mut router: SessionRouter,
    mut signals: broadcast::Receiver<SessionSignal>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mode: Arc<watch::Sender<Option<String>>>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = signals.recv() => received,
        };

        match received {
            Ok(signal) => {
                for event in router.handle(signal) {
                    if let TransportEvent::ModeChanged { mode_id } = &event {
                        mode.send_replace(Some(mode_id.clone()));
                    }
                    if events.send(event).is_err() {
                        debug!("event sequence dropped, stopping router pump");
                        return;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "router pump lagged behind session updates");
                let _ = events.send(TransportEvent::Error {
                    message: format!("{skipped} session updates were dropped"),
                });
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("router pump stopped");
}
