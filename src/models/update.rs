//! `session/update` payload variants.
//!
//! The agent streams conversation progress as notifications whose `update`
//! object is tagged by `sessionUpdate`. Tags this crate does not know are kept
//! as [`SessionUpdate::Unknown`] so newer agents never break the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::tool_call::{ToolCallRecord, ToolCallUpdate};
use crate::{AppError, Result};

/// One entry of an agent execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    /// Description of the step.
    pub content: String,
    /// `high`, `medium` or `low`.
    #[serde(default)]
    pub priority: String,
    /// `pending`, `in_progress` or `completed`.
    #[serde(default)]
    pub status: String,
}

/// A slash command the agent advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    /// Command name without the leading slash.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Input hint, if the command takes an argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Tagged union of everything an agent can stream for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Replayed user message content (during `session/load`).
    UserMessageChunk {
        /// Content block.
        content: Value,
    },
    /// Assistant output.
    AgentMessageChunk {
        /// Content block.
        content: Value,
    },
    /// Assistant reasoning.
    AgentThoughtChunk {
        /// Content block.
        content: Value,
    },
    /// A new tool call.
    ToolCall(ToolCallRecord),
    /// Changed fields of an existing tool call.
    ToolCallUpdate(ToolCallUpdate),
    /// Full replacement of the execution plan.
    Plan {
        /// Plan entries in order.
        entries: Vec<PlanEntry>,
    },
    /// The session switched modes.
    CurrentModeUpdate {
        /// Id of the now-active mode.
        current_mode_id: String,
    },
    /// The agent's slash commands changed.
    AvailableCommandsUpdate {
        /// Commands now available.
        available_commands: Vec<AvailableCommand>,
    },
    /// A tag this client does not understand.
    Unknown {
        /// Value of the `sessionUpdate` tag.
        kind: String,
        /// The full update object.
        raw: Value,
    },
}

/// Parameters of one `session/update` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotification {
    /// Session the update belongs to.
    pub session_id: String,
    /// Decoded update.
    pub update: SessionUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentParams {
    content: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanParams {
    #[serde(default)]
    entries: Vec<PlanEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeParams {
    current_mode_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandsParams {
    #[serde(default)]
    available_commands: Vec<AvailableCommand>,
}

impl SessionNotification {
    /// Decode `session/update` params.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Decode`] when `sessionId` or `update` is missing or
    /// a known variant has malformed fields.
    pub fn from_params(params: Value) -> Result<Self> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Decode("session/update without sessionId".into()))?
            .to_owned();
        let update = params
            .get("update")
            .cloned()
            .ok_or_else(|| AppError::Decode("session/update without update".into()))?;
        Ok(Self {
            session_id,
            update: SessionUpdate::from_value(update)?,
        })
    }
}

impl SessionUpdate {
    /// Decode one update object by its `sessionUpdate` tag.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Decode`] when the tag is missing or a known
    /// variant fails to deserialize.
    pub fn from_value(raw: Value) -> Result<Self> {
        let kind = raw
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Decode("update without sessionUpdate tag".into()))?
            .to_owned();

        let decoded = match kind.as_str() {
            "user_message_chunk" => Self::UserMessageChunk {
                content: field::<ContentParams>(&kind, raw)?.content,
            },
            "agent_message_chunk" => Self::AgentMessageChunk {
                content: field::<ContentParams>(&kind, raw)?.content,
            },
            "agent_thought_chunk" => Self::AgentThoughtChunk {
                content: field::<ContentParams>(&kind, raw)?.content,
            },
            "tool_call" => Self::ToolCall(field(&kind, raw)?),
            "tool_call_update" => Self::ToolCallUpdate(field(&kind, raw)?),
            "plan" => Self::Plan {
                entries: field::<PlanParams>(&kind, raw)?.entries,
            },
            "current_mode_update" => Self::CurrentModeUpdate {
                current_mode_id: field::<ModeParams>(&kind, raw)?.current_mode_id,
            },
            "available_commands_update" => Self::AvailableCommandsUpdate {
                available_commands: field::<CommandsParams>(&kind, raw)?.available_commands,
            },
            _ => Self::Unknown { kind, raw },
        };
        Ok(decoded)
    }
}

fn field<T: serde::de::DeserializeOwned>(kind: &str, raw: Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| AppError::Decode(format!("malformed {kind}: {e}")))
}

/// Flatten a content block to display text.
///
/// Text blocks yield their text, resource links their name or URI, embedded
/// resources their text; anything else yields an empty string.
#[must_use]
pub fn content_text(content: &Value) -> String {
    match content.get("type").and_then(Value::as_str) {
        Some("text") => content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        Some("resource_link") => content
            .get("name")
            .or_else(|| content.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        Some("resource") => content
            .pointer("/resource/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        _ => String::new(),
    }
}
