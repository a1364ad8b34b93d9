//! Session router.
//!
//! Every `session/update` from an agent lands on one broadcast channel as a
//! [`SessionSignal`]. A [`SessionRouter`] owns the view of one session: it
//! filters the broadcast down to that session, keeps the tool-call table and
//! turns each update into [`TransportEvent`]s addressed to a logical
//! conversation.
//!
//! # Conversations
//!
//! Output belongs to the primary conversation unless it comes from a
//! sub-agent. A tool call classified as a sub-agent spawn (see
//! [`is_subagent_spawn`]) gets a fresh [`ConversationId`] and a route
//! `toolCallId → conversation`. The route is inserted in the same step that
//! classifies the call, so no later update for that id can miss it.
//!
//! Lookup order for a tool call:
//! 1. the route map, keyed by its own id;
//! 2. the route of the parent tool call named in its `_meta`;
//! 3. the primary conversation.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::TransportEvent;
use crate::models::tool_call::{is_subagent_spawn, ToolCallRecord, ToolCallUpdate};
use crate::models::update::{content_text, SessionNotification, SessionUpdate};

/// Identifier of a logical conversation within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationId(String);

impl ConversationId {
    /// The session's main conversation.
    #[must_use]
    pub fn primary() -> Self {
        Self("primary".into())
    }

    fn subagent() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Whether this is the primary conversation.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.0 == "primary"
    }

    /// String form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Item carried on the shared session broadcast.
///
/// Turn results travel on the same channel as updates so they are always
/// observed after the updates that preceded them on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// A decoded `session/update` notification.
    Update(SessionNotification),
    /// A `session/prompt` call returned.
    TurnEnded {
        /// Session the turn belonged to.
        session_id: String,
        /// Agent stop reason (`end_turn`, `cancelled`, …).
        stop_reason: String,
    },
    /// A `session/prompt` call failed.
    TurnFailed {
        /// Session the turn belonged to.
        session_id: String,
        /// Failure description.
        message: String,
    },
}

impl SessionSignal {
    /// Session this signal belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Update(notification) => &notification.session_id,
            Self::TurnEnded { session_id, .. } | Self::TurnFailed { session_id, .. } => session_id,
        }
    }
}

/// Per-session demultiplexer and tool-call table.
#[derive(Debug)]
pub struct SessionRouter {
    session_ids: Vec<String>,
    routes: HashMap<String, ConversationId>,
    tool_calls: HashMap<String, ToolCallRecord>,
    current_mode: Option<String>,
}

impl SessionRouter {
    /// Create a router for `session_id`.
    #[must_use]
    pub fn new(session_id: &str) -> Self {
        Self {
            session_ids: vec![session_id.to_owned()],
            routes: HashMap::new(),
            tool_calls: HashMap::new(),
            current_mode: None,
        }
    }

    /// Also accept signals addressed to `session_id` (e.g. the id the agent
    /// reassigned on `session/load`).
    pub fn add_alias(&mut self, session_id: &str) {
        if !self.session_ids.iter().any(|id| id == session_id) {
            self.session_ids.push(session_id.to_owned());
        }
    }

    /// Whether `signal` belongs to this session.
    #[must_use]
    pub fn route(&self, signal: &SessionSignal) -> bool {
        let target = signal.session_id();
        self.session_ids.iter().any(|id| id == target)
    }

    /// Translate one signal into events. Signals for other sessions yield
    /// nothing.
    pub fn handle(&mut self, signal: SessionSignal) -> Vec<TransportEvent> {
        if !self.route(&signal) {
            return Vec::new();
        }
        match signal {
            SessionSignal::Update(notification) => self.handle_update(notification.update),
            SessionSignal::TurnEnded { stop_reason, .. } => {
                vec![TransportEvent::TurnComplete { stop_reason }]
            }
            SessionSignal::TurnFailed { message, .. } => vec![TransportEvent::Error { message }],
        }
    }

    /// Translate one update into events.
    pub fn handle_update(&mut self, update: SessionUpdate) -> Vec<TransportEvent> {
        match update {
            SessionUpdate::AgentMessageChunk { content } => text_event(&content, |text| {
                TransportEvent::Text {
                    conversation: ConversationId::primary(),
                    text,
                }
            }),
            SessionUpdate::AgentThoughtChunk { content } => text_event(&content, |text| {
                TransportEvent::Thought {
                    conversation: ConversationId::primary(),
                    text,
                }
            }),
            SessionUpdate::UserMessageChunk { content } => text_event(&content, |text| {
                TransportEvent::UserText {
                    conversation: ConversationId::primary(),
                    text,
                }
            }),
            SessionUpdate::ToolCall(record) => self.handle_tool_call(record),
            SessionUpdate::ToolCallUpdate(update) => self.update_tool_call(&update),
            SessionUpdate::Plan { entries } => vec![TransportEvent::Plan { entries }],
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                self.current_mode = Some(current_mode_id.clone());
                vec![TransportEvent::ModeChanged {
                    mode_id: current_mode_id,
                }]
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                vec![TransportEvent::AvailableCommands {
                    commands: available_commands,
                }]
            }
            SessionUpdate::Unknown { kind, .. } => {
                debug!(kind = %kind, "router: unknown session update, ignoring");
                Vec::new()
            }
        }
    }

    /// Record a newly announced tool call.
    ///
    /// The call itself is reported in the conversation it was issued from; a
    /// spawn additionally opens a new conversation that receives every later
    /// update for the call.
    pub fn handle_tool_call(&mut self, mut record: ToolCallRecord) -> Vec<TransportEvent> {
        let conversation = self.conversation_for(&record.tool_call_id, record.parent_tool_call_id());
        let mut events = Vec::new();

        if let Some(previous) = self.tool_calls.get(&record.tool_call_id) {
            record.is_subagent_spawn = previous.is_subagent_spawn;
        }
        if !record.is_subagent_spawn && is_subagent_spawn(&record.title, record.raw_input.as_ref())
        {
            record.is_subagent_spawn = true;
            let child = self.register_route(&record.tool_call_id);
            events.push(TransportEvent::SubagentStarted {
                conversation: child,
                parent: conversation.clone(),
                tool_call_id: record.tool_call_id.clone(),
                title: record.title.clone(),
            });
        }

        self.tool_calls
            .insert(record.tool_call_id.clone(), record.clone());
        events.insert(
            0,
            TransportEvent::ToolCall {
                conversation,
                call: record,
            },
        );
        events
    }

    /// Merge a partial update into the tool-call table.
    ///
    /// Only fields present in `update` change. Updates for unknown ids create
    /// the record.
    pub fn update_tool_call(&mut self, update: &ToolCallUpdate) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let id = update.tool_call_id.clone();

        let previous_status = self.tool_calls.get(&id).map(|r| r.status);
        let mut record = match self.tool_calls.remove(&id) {
            Some(mut record) => {
                record.apply(update);
                record
            }
            None => ToolCallRecord::from_update(update),
        };

        let supplies_classification = update.title.is_some() || update.raw_input.is_some();
        if !record.is_subagent_spawn
            && supplies_classification
            && is_subagent_spawn(&record.title, record.raw_input.as_ref())
        {
            record.is_subagent_spawn = true;
            let parent = self.conversation_for(&id, record.parent_tool_call_id());
            let child = self.register_route(&id);
            events.push(TransportEvent::SubagentStarted {
                conversation: child,
                parent,
                tool_call_id: id.clone(),
                title: record.title.clone(),
            });
        }

        let conversation = self.conversation_for(&id, record.parent_tool_call_id());
        let became_terminal = record.status.is_terminal()
            && !matches!(previous_status, Some(status) if status.is_terminal());
        let finished = became_terminal && self.routes.contains_key(&id);

        self.tool_calls.insert(id.clone(), record.clone());
        events.push(TransportEvent::ToolCallUpdated {
            conversation: conversation.clone(),
            call: record.clone(),
        });

        if finished {
            info!(tool_call_id = %id, %conversation, status = ?record.status, "sub-agent finished");
            events.push(TransportEvent::SubagentFinished {
                conversation,
                tool_call_id: id,
                status: record.status,
            });
        }
        events
    }

    /// Conversation that should receive output for `tool_call_id`.
    #[must_use]
    pub fn conversation_for(&self, tool_call_id: &str, parent: Option<&str>) -> ConversationId {
        self.routes
            .get(tool_call_id)
            .or_else(|| parent.and_then(|p| self.routes.get(p)))
            .cloned()
            .unwrap_or_else(ConversationId::primary)
    }

    /// Open a conversation for `tool_call_id` and route it there.
    ///
    /// Returns the existing conversation when a route is already present.
    pub fn register_route(&mut self, tool_call_id: &str) -> ConversationId {
        if let Some(existing) = self.routes.get(tool_call_id) {
            return existing.clone();
        }
        let conversation = ConversationId::subagent();
        info!(tool_call_id, %conversation, "sub-agent conversation opened");
        self.routes
            .insert(tool_call_id.to_owned(), conversation.clone());
        conversation
    }

    /// Remove the route for `tool_call_id`.
    pub fn unregister_route(&mut self, tool_call_id: &str) -> Option<ConversationId> {
        self.routes.remove(tool_call_id)
    }

    /// Drop every route and tool call.
    pub fn reset(&mut self) {
        self.routes.clear();
        self.tool_calls.clear();
    }

    /// Current state of a tool call.
    #[must_use]
    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.get(tool_call_id)
    }

    /// Number of live sub-agent routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Mode last announced through `current_mode_update`.
    #[must_use]
    pub fn current_mode(&self) -> Option<&str> {
        self.current_mode.as_deref()
    }
}

fn text_event(
    content: &serde_json::Value,
    build: impl FnOnce(String) -> TransportEvent,
) -> Vec<TransportEvent> {
    let text = content_text(content);
    if text.is_empty() {
        Vec::new()
    } else {
        vec![build(text)]
    }
}
