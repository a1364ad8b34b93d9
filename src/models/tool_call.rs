//! Tool-call records and partial updates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of one tool invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Announced but not started (often awaiting permission).
    #[default]
    Pending,
    /// Currently running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error or was rejected.
    Failed,
}

impl ToolCallStatus {
    /// `completed` or `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A file location touched by a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLocation {
    /// Absolute file path.
    pub path: String,
    /// Optional 1-based line number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Accumulated state of one tool call, built from a `tool_call` update and
/// refined by later `tool_call_update`s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Agent-assigned identifier.
    pub tool_call_id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Current status.
    #[serde(default)]
    pub status: ToolCallStatus,
    /// Tool category (`read`, `edit`, `execute`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Raw tool input as sent by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    /// Raw tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    /// Structured content blocks (text, diffs, terminals).
    #[serde(default)]
    pub content: Vec<Value>,
    /// Files affected by the call.
    #[serde(default)]
    pub locations: Vec<ToolCallLocation>,
    /// Set by the router when the call spawned a sub-agent conversation.
    #[serde(skip)]
    pub is_subagent_spawn: bool,
    /// Protocol extension metadata.
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A partial update: every `None` field means "unchanged".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Identifier of the call being updated.
    pub tool_call_id: String,
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    /// New kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Replacement raw input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    /// Replacement raw output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    /// Replacement content list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Value>>,
    /// Replacement locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ToolCallLocation>>,
    /// Replacement metadata.
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ToolCallRecord {
    /// Build a record from an update for an id never announced by `tool_call`.
    #[must_use]
    pub fn from_update(update: &ToolCallUpdate) -> Self {
        let mut record = Self {
            tool_call_id: update.tool_call_id.clone(),
            title: String::new(),
            status: ToolCallStatus::Pending,
            kind: None,
            raw_input: None,
            raw_output: None,
            content: Vec::new(),
            locations: Vec::new(),
            is_subagent_spawn: false,
            meta: None,
        };
        record.apply(update);
        record
    }

    /// Merge the fields present in `update`; absent fields stay untouched.
    pub fn apply(&mut self, update: &ToolCallUpdate) {
        if let Some(title) = &update.title {
            self.title.clone_from(title);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(kind) = &update.kind {
            self.kind = Some(kind.clone());
        }
        if let Some(raw_input) = &update.raw_input {
            self.raw_input = Some(raw_input.clone());
        }
        if let Some(raw_output) = &update.raw_output {
            self.raw_output = Some(raw_output.clone());
        }
        if let Some(content) = &update.content {
            self.content.clone_from(content);
        }
        if let Some(locations) = &update.locations {
            self.locations.clone_from(locations);
        }
        if let Some(meta) = &update.meta {
            self.meta = Some(meta.clone());
        }
    }

    /// Parent tool call named in the extension metadata, if any.
    #[must_use]
    pub fn parent_tool_call_id(&self) -> Option<&str> {
        parent_from_meta(self.meta.as_ref())
    }
}

impl ToolCallUpdate {
    /// Parent tool call named in the extension metadata, if any.
    #[must_use]
    pub fn parent_tool_call_id(&self) -> Option<&str> {
        parent_from_meta(self.meta.as_ref())
    }
}

/// Heuristic sub-agent detector.
///
/// No protocol flag marks a sub-agent, so a call counts as one when its title
/// contains "task" or "agent" (any case) or its raw input has a
/// `subagent_type` field. Tools that merely mention "task" in their title are
/// misclassified as well.
#[must_use]
pub fn is_subagent_spawn(title: &str, raw_input: Option<&Value>) -> bool {
    let title = title.to_lowercase();
    if title.contains("task") || title.contains("agent") {
        return true;
    }
    raw_input
        .and_then(Value::as_object)
        .is_some_and(|input| input.contains_key("subagent_type"))
}

/// Look up a parent tool-call id under the metadata keys agents use for it.
pub(crate) fn parent_from_meta(meta: Option<&Value>) -> Option<&str> {
    let meta = meta?;
    meta.pointer("/claudeCode/parentToolUseId")
        .or_else(|| meta.get("parentToolCallId"))
        .or_else(|| meta.get("parent_tool_use_id"))
        .and_then(Value::as_str)
}
