//! Permission broker.
//!
//! Holds every permission request the agent is waiting on until the user (or
//! a policy) decides. The agent-side handler parks on a `oneshot` receiver
//! returned by [`PermissionBroker::submit`]; the decision side resolves the
//! request by id through [`PermissionBroker::resolve`] or one of its helpers.
//!
//! Each request resolves exactly once. A second resolution of the same id is
//! reported as [`AppError::AlreadyConsumed`] rather than ignored, as long as
//! the id is among the last [`RESOLVED_HISTORY`] resolved ones; older ids
//! are forgotten and report [`AppError::NotFound`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::models::permission::{PermissionOutcome, PermissionRequest};
use crate::{AppError, Result};

/// Number of resolved ids remembered for [`AppError::AlreadyConsumed`].
pub const RESOLVED_HISTORY: usize = 1024;

struct Entry {
    request: PermissionRequest,
    tx: oneshot::Sender<PermissionOutcome>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Entry>,
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
}

impl State {
    fn mark_resolved(&mut self, id: &str) {
        if !self.resolved.insert(id.to_owned()) {
            return;
        }
        self.resolved_order.push_back(id.to_owned());
        while self.resolved_order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}

/// Shared handle to the pending permission table.
#[derive(Clone)]
pub struct PermissionBroker {
    state: Arc<Mutex<State>>,
    requests_tx: mpsc::UnboundedSender<PermissionRequest>,
    requests_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<PermissionRequest>>>>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker").finish_non_exhaustive()
    }
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State::default())),
            requests_tx,
            requests_rx: Arc::new(Mutex::new(Some(requests_rx))),
        }
    }

    /// Register a request and return the receiver its outcome arrives on.
    ///
    /// The request is also published on the sequence returned by
    /// [`PermissionBroker::take_requests`].
    pub async fn submit(&self, request: PermissionRequest) -> oneshot::Receiver<PermissionOutcome> {
        let (tx, rx) = oneshot::channel();
        info!(
            request_id = %request.id,
            session_id = %request.session_id,
            tool = %request.tool_name,
            "permission requested"
        );
        self.state.lock().await.pending.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                tx,
            },
        );
        if self.requests_tx.send(request).is_err() {
            debug!("permission request sequence dropped, request stays pending");
        }
        rx
    }

    /// Take the sequence of newly submitted requests.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AlreadyConsumed`] on the second call.
    pub async fn take_requests(&self) -> Result<mpsc::UnboundedReceiver<PermissionRequest>> {
        self.requests_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::AlreadyConsumed("permission request sequence".into()))
    }

    /// Snapshot of outstanding requests, oldest first.
    pub async fn pending(&self) -> Vec<PermissionRequest> {
        let state = self.state.lock().await;
        let mut requests: Vec<_> = state.pending.values().map(|e| e.request.clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Whether `id` is still awaiting a decision.
    pub async fn is_pending(&self, id: &str) -> bool {
        self.state.lock().await.pending.contains_key(id)
    }

    /// Resolve request `id` with `outcome`.
    ///
    /// # Errors
    ///
    /// - [`AppError::AlreadyConsumed`] if `id` was already resolved.
    /// - [`AppError::NotFound`] if `id` was never submitted.
    pub async fn resolve(&self, id: &str, outcome: PermissionOutcome) -> Result<()> {
        let entry = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.pending.remove(id) else {
                return Err(if state.resolved.contains(id) {
                    AppError::AlreadyConsumed(format!("permission request {id} already resolved"))
                } else {
                    AppError::NotFound(format!("no permission request with id {id}"))
                });
            };
            state.mark_resolved(id);
            entry
        };

        info!(
            request_id = id,
            tool = %entry.request.tool_name,
            outcome = outcome.label(),
            "permission resolved"
        );
        if entry.tx.send(outcome).is_err() {
            warn!(request_id = id, "permission requester already gone");
        }
        Ok(())
    }

    /// Allow, optionally replacing the tool input.
    ///
    /// # Errors
    ///
    /// See [`PermissionBroker::resolve`].
    pub async fn allow(&self, id: &str, updated_input: Option<Value>) -> Result<()> {
        self.resolve(id, PermissionOutcome::Allow { updated_input })
            .await
    }

    /// Deny with a reason forwarded to the agent.
    ///
    /// # Errors
    ///
    /// See [`PermissionBroker::resolve`].
    pub async fn deny(&self, id: &str, reason: &str) -> Result<()> {
        self.resolve(
            id,
            PermissionOutcome::Deny {
                reason: reason.to_owned(),
            },
        )
        .await
    }

    /// Withdraw the request.
    ///
    /// # Errors
    ///
    /// See [`PermissionBroker::resolve`].
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.resolve(id, PermissionOutcome::Cancelled).await
    }

    /// Resolve every outstanding request as cancelled.
    ///
    /// Returns the number of requests cancelled.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Entry)> = {
            let mut state = self.state.lock().await;
            let drained: Vec<_> = state.pending.drain().collect();
            for (id, _) in &drained {
                state.mark_resolved(id);
            }
            drained
        };

        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(PermissionOutcome::Cancelled);
        }
        if count > 0 {
            info!(count, reason, "outstanding permission requests cancelled");
        }
        count
    }
}
