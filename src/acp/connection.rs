//! Bidirectional JSON-RPC connection.
//!
//! An [`RpcConnection`] owns the line-framed channel to one agent: a reader
//! task, a writer task and a dispatcher task. Outbound calls are correlated
//! with their responses through a [`PendingCalls`] arena keyed by integer
//! request id. Inbound requests and notifications are routed to handlers
//! registered with [`RpcConnection::on_request`] and
//! [`RpcConnection::on_notification`].
//!
//! # State machine
//!
//! `Uninitialized → Initializing → Ready → Closed`, with `Closed` reachable
//! from every state (stream EOF, write failure, or [`RpcConnection::close`]).
//! Entering `Closed` fails every pending call with
//! [`AppError::ConnectionClosed`]; no call is ever left unresolved.
//!
//! # Dispatch order
//!
//! Frames are dispatched strictly in arrival order. Notification handlers run
//! inline, so a notification is fully handled before the next frame is looked
//! at. Request handlers run on their own task because they may wait on the
//! user (permission prompts); a later frame can therefore finish first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::handshake;
use crate::acp::reader::{run_reader, Inbound};
use crate::acp::writer::run_writer;
use crate::models::rpc::{RequestId, RpcError, RpcMessage};
use crate::models::session::{ClientCapabilities, NegotiatedCapabilities};
use crate::traffic::TrafficLog;
use crate::{AppError, Result};

/// Capacity of the outbound frame queue and the inbound frame queue.
const CHANNEL_CAPACITY: usize = 256;

/// Handler for an inbound request; its result becomes the response.
pub type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handler for an inbound notification.
pub type NotificationHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Channel open, `initialize` not yet sent.
    Uninitialized,
    /// `initialize` in flight.
    Initializing,
    /// Handshake done; session calls allowed.
    Ready,
    /// Torn down; every call fails.
    Closed,
}

// ── Pending-call arena ───────────────────────────────────────────────────────

/// Outstanding outbound calls keyed by request id.
///
/// Each entry is removed exactly once: by its response, by an explicit
/// [`PendingCalls::remove`] (also issued when a caller abandons its call),
/// or by [`PendingCalls::fail_all`] at teardown.
/// After `fail_all` the arena refuses new registrations.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<i64, oneshot::Sender<Result<Value>>>,
    closed: Option<String>,
}

impl PendingCalls {
    /// Register a slot for `id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::ConnectionClosed`] after [`PendingCalls::fail_all`].
    /// - [`AppError::Protocol`] if `id` is already pending.
    pub fn register(&mut self, id: i64) -> Result<oneshot::Receiver<Result<Value>>> {
        if let Some(reason) = &self.closed {
            return Err(AppError::ConnectionClosed(reason.clone()));
        }
        if self.calls.contains_key(&id) {
            return Err(AppError::Protocol(format!("request id {id} already pending")));
        }
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        Ok(rx)
    }

    /// Deliver `outcome` to the caller waiting on `id`.
    ///
    /// Returns `false` when no call with that id is pending (unknown or
    /// already answered).
    pub fn resolve(&mut self, id: i64, outcome: Result<Value>) -> bool {
        let Some(tx) = self.calls.remove(&id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            debug!(id, "pending call receiver already dropped");
        }
        true
    }

    /// Drop the slot for `id` without resolving it.
    pub fn remove(&mut self, id: i64) {
        self.calls.remove(&id);
    }

    /// Fail every pending call with `reason` and refuse new ones.
    ///
    /// Returns the number of calls failed.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        self.closed = Some(reason.to_owned());
        let count = self.calls.len();
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(AppError::ConnectionClosed(reason.to_owned())));
        }
        count
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is awaiting a response.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Reason passed to [`PendingCalls::fail_all`], once closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

struct Inner {
    label: String,
    outbound: mpsc::Sender<Value>,
    pending: Mutex<PendingCalls>,
    next_id: AtomicI64,
    state: watch::Sender<ConnectionState>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    cancel: CancellationToken,
    decode_failures: AtomicU64,
}

/// Cheaply cloneable handle to one JSON-RPC connection.
#[derive(Clone)]
pub struct RpcConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("label", &self.inner.label)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Start the reader, writer and dispatcher tasks over `reader`/`writer`.
    ///
    /// `traffic` receives every frame in both directions; it is the caller's
    /// job to close it at teardown.
    #[must_use]
    pub fn start<R, W>(label: &str, reader: R, writer: W, traffic: TrafficLog) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            label: label.to_owned(),
            outbound: outbound_tx,
            pending: Mutex::new(PendingCalls::default()),
            next_id: AtomicI64::new(1),
            state,
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            cancel: cancel.clone(),
            decode_failures: AtomicU64::new(0),
        });

        tokio::spawn(run_reader(
            label.to_owned(),
            reader,
            inbound_tx,
            cancel.clone(),
            traffic.clone(),
        ));

        let writer_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let result = run_writer(
                writer_inner.label.clone(),
                writer,
                outbound_rx,
                writer_inner.cancel.clone(),
                traffic,
            )
            .await;
            if let Err(err) = result {
                writer_inner.close(&err.to_string()).await;
            }
        });

        tokio::spawn(run_dispatch(Arc::clone(&inner), inbound_rx));

        debug!(connection = label, "rpc connection started");
        Self { inner }
    }

    /// Label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch channel following the lifecycle state.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of inbound lines that failed to decode so far.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.inner.decode_failures.load(Ordering::Relaxed)
    }

    /// Number of outbound calls awaiting a response.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Wait until the connection is closed and return the close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
        self.inner
            .pending
            .lock()
            .await
            .close_reason()
            .unwrap_or("closed")
            .to_owned()
    }

    /// Register the handler for inbound requests named `method`.
    ///
    /// Replaces any earlier handler for the same method.
    pub async fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .request_handlers
            .write()
            .await
            .insert(method.to_owned(), handler);
    }

    /// Register the handler for inbound notifications named `method`.
    ///
    /// Replaces any earlier handler for the same method.
    pub async fn on_notification<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .notification_handlers
            .write()
            .await
            .insert(method.to_owned(), handler);
    }

    /// Perform the `initialize` exchange.
    ///
    /// Must be the first call on a fresh connection. On failure the
    /// connection returns to `Uninitialized` (unless it closed meanwhile).
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] if `initialize` was already issued or the
    ///   agent's protocol version is unsupported.
    /// - [`AppError::ConnectionClosed`] if the connection is closed.
    /// - [`AppError::Rpc`] if the agent rejects the request.
    pub async fn initialize(
        &self,
        capabilities: ClientCapabilities,
    ) -> Result<NegotiatedCapabilities> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Uninitialized {
                *state = ConnectionState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(match self.state() {
                ConnectionState::Closed => self.closed_error().await,
                other => AppError::Protocol(format!("initialize issued in state {other:?}")),
            });
        }

        let negotiated = self
            .send_request("initialize", handshake::initialize_params(capabilities))
            .await
            .and_then(handshake::parse_negotiated);

        let next = if negotiated.is_ok() {
            ConnectionState::Ready
        } else {
            ConnectionState::Uninitialized
        };
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Initializing {
                *state = next;
                true
            } else {
                false
            }
        });

        if let Ok(caps) = &negotiated {
            info!(
                connection = %self.inner.label,
                protocol_version = caps.protocol_version,
                "rpc connection initialized"
            );
        }
        negotiated
    }

    /// Issue a request and wait for its response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] if called before `initialize` completed.
    /// - [`AppError::ConnectionClosed`] if the connection is or becomes
    ///   closed before the response arrives.
    /// - [`AppError::Rpc`] if the agent answers with an error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(self.closed_error().await),
            ConnectionState::Uninitialized | ConnectionState::Initializing => {
                return Err(AppError::Protocol(format!(
                    "`{method}` issued before initialize completed"
                )));
            }
        }
        self.send_request(method, params).await
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] if the connection is closed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(self.closed_error().await);
        }
        let frame = RpcMessage::notification(method, params).to_value();
        debug!(connection = %self.inner.label, method, "rpc: notification →");
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| AppError::ConnectionClosed("writer stopped".into()))
    }

    /// Close the connection: fail pending calls and stop the channel tasks.
    ///
    /// Idempotent; only the first reason is kept.
    pub async fn close(&self, reason: &str) {
        self.inner.close(reason).await;
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.inner.pending.lock().await.register(id)?;
        let slot = PendingSlot {
            inner: Arc::clone(&self.inner),
            id,
        };

        debug!(connection = %self.inner.label, id, method, "rpc: request →");
        let frame = RpcMessage::request(id, method, params).to_value();
        if self.inner.outbound.send(frame).await.is_err() {
            return Err(self.closed_error().await);
        }

        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(AppError::ConnectionClosed("pending call dropped".into())));
        drop(slot);
        outcome
    }

    async fn closed_error(&self) -> AppError {
        let reason = self
            .inner
            .pending
            .lock()
            .await
            .close_reason()
            .unwrap_or("connection closed")
            .to_owned();
        AppError::ConnectionClosed(reason)
    }
}

/// Removes a call's slot from the arena when the caller stops waiting,
/// whether it finished or its future was dropped (timeout, `select!`).
struct PendingSlot {
    inner: Arc<Inner>,
    id: i64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.try_lock() {
            pending.remove(self.id);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let id = self.id;
        runtime.spawn(async move {
            inner.pending.lock().await.remove(id);
        });
    }
}

impl Inner {
    async fn close(&self, reason: &str) {
        let failed = {
            let mut pending = self.pending.lock().await;
            if pending.close_reason().is_some() {
                return;
            }
            pending.fail_all(reason)
        };
        self.state.send_replace(ConnectionState::Closed);
        self.cancel.cancel();
        info!(
            connection = %self.label,
            reason,
            failed_calls = failed,
            "rpc connection closed"
        );
    }

    async fn resolve_response(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) {
        let RequestId::Number(numeric) = id else {
            warn!(connection = %self.label, %id, "rpc: response with non-numeric id, dropping");
            return;
        };
        let delivered = self
            .pending
            .lock()
            .await
            .resolve(numeric, outcome.map_err(AppError::from));
        if delivered {
            debug!(connection = %self.label, id = numeric, "rpc: response ←");
        } else {
            warn!(
                connection = %self.label,
                id = numeric,
                "rpc: response for unknown or already answered request, dropping"
            );
        }
    }

    async fn dispatch_request(&self, id: RequestId, method: String, params: Value) {
        let handler = self.request_handlers.read().await.get(&method).cloned();
        let outbound = self.outbound.clone();
        let label = self.label.clone();

        let Some(handler) = handler else {
            warn!(connection = %label, %id, method = %method, "rpc: no handler for inbound request");
            let response = RpcMessage::Response {
                id,
                outcome: Err(RpcError::method_not_found(&method)),
            };
            if outbound.send(response.to_value()).await.is_err() {
                debug!(connection = %label, "rpc: writer stopped before error response");
            }
            return;
        };

        debug!(connection = %label, %id, method = %method, "rpc: request ←");
        tokio::spawn(async move {
            let outcome = handler(params).await.map_err(|err| {
                warn!(connection = %label, %id, method = %method, %err, "rpc: inbound request failed");
                RpcError::from(&err)
            });
            let response = RpcMessage::Response { id, outcome };
            if outbound.send(response.to_value()).await.is_err() {
                debug!(connection = %label, method = %method, "rpc: writer stopped before response");
            }
        });
    }

    async fn reject_invalid_request(&self, id: RequestId, error: &str) {
        debug!(connection = %self.label, %id, "rpc: answering invalid request with -32600");
        let response = RpcMessage::Response {
            id,
            outcome: Err(RpcError::invalid_request(error)),
        };
        if self.outbound.send(response.to_value()).await.is_err() {
            debug!(connection = %self.label, "rpc: writer stopped before error response");
        }
    }

    async fn dispatch_notification(&self, method: String, params: Value) {
        let handler = self.notification_handlers.read().await.get(&method).cloned();
        match handler {
            Some(handler) => handler(params).await,
            None => {
                debug!(connection = %self.label, method = %method, "rpc: unhandled notification, dropping");
            }
        }
    }
}

/// Dispatcher task: consume reader output in arrival order.
async fn run_dispatch(inner: Arc<Inner>, mut inbound_rx: mpsc::Receiver<Inbound>) {
    while let Some(item) = inbound_rx.recv().await {
        match item {
            Inbound::Message(RpcMessage::Response { id, outcome }) => {
                inner.resolve_response(id, outcome).await;
            }
            Inbound::Message(RpcMessage::Request { id, method, params }) => {
                inner.dispatch_request(id, method, params).await;
            }
            Inbound::Message(RpcMessage::Notification { method, params }) => {
                inner.dispatch_notification(method, params).await;
            }
            Inbound::Malformed { raw, error } => {
                inner.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %inner.label,
                    error = %error,
                    raw_line = %raw,
                    "rpc: undecodable line, skipping"
                );
                if let Some(id) = RpcMessage::recover_request_id(&raw) {
                    inner.reject_invalid_request(id, &error).await;
                }
            }
            Inbound::Closed { reason } => {
                inner.close(&reason).await;
                break;
            }
        }
    }
}
