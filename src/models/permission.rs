//! Interactive permission requests and their outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{AppError, Result};

/// One choice the agent offers for a permission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Id echoed back when this option is selected.
    pub option_id: String,
    /// Display label.
    #[serde(default)]
    pub name: String,
    /// `allow_once`, `allow_always`, `reject_once` or `reject_always`.
    #[serde(default)]
    pub kind: String,
}

impl PermissionOption {
    fn is_allow(&self) -> bool {
        self.kind.starts_with("allow")
    }

    fn is_reject(&self) -> bool {
        self.kind.starts_with("reject")
    }
}

/// An authorization the agent needs before running a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionRequest {
    /// Broker-assigned identifier used to resolve the request.
    pub id: String,
    /// Session the request belongs to.
    pub session_id: String,
    /// Tool call awaiting authorization.
    pub tool_call_id: String,
    /// Tool name (e.g. `Bash`).
    pub tool_name: String,
    /// Input the tool would run with.
    pub tool_input: Value,
    /// Choices offered by the agent.
    pub options: Vec<PermissionOption>,
    /// Arrival timestamp.
    pub created_at: DateTime<Utc>,
}

/// Final decision on a permission request.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    /// Run the tool, optionally with edited input the agent must honour.
    Allow {
        /// Replacement tool input.
        updated_input: Option<Value>,
    },
    /// Refuse, with a reason forwarded to the agent.
    Deny {
        /// Human-readable reason.
        reason: String,
    },
    /// Withdrawn (user dismissed it or the connection closed).
    Cancelled,
}

impl PermissionRequest {
    /// Decode `session/request_permission` params.
    ///
    /// The tool name is taken from the agent's metadata when present and
    /// otherwise falls back to the tool call title, then its kind.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidParams`] when `sessionId` or
    /// `toolCall.toolCallId` is missing or `options` is malformed.
    pub fn from_params(params: &Value) -> Result<Self> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::InvalidParams("request_permission: missing sessionId".into()))?;
        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let tool_call_id = tool_call
            .get("toolCallId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AppError::InvalidParams("request_permission: missing toolCall.toolCallId".into())
            })?;

        let tool_name = tool_call
            .pointer("/_meta/claudeCode/toolName")
            .or_else(|| tool_call.get("title"))
            .or_else(|| tool_call.get("kind"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();

        let options = match params.get("options") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                AppError::InvalidParams(format!("request_permission: bad options: {e}"))
            })?,
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            tool_call_id: tool_call_id.to_owned(),
            tool_name,
            tool_input: tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
            options,
            created_at: Utc::now(),
        })
    }
}

impl PermissionOutcome {
    /// Encode as the `session/request_permission` result.
    ///
    /// The ACP `outcome` selects the first matching allow/reject option (or
    /// reports `cancelled` when the agent offered none). The `behavior`,
    /// `updatedInput` and `message` fields carry the same decision for
    /// agents speaking the direct CLI permission protocol.
    #[must_use]
    pub fn to_response(&self, options: &[PermissionOption]) -> Value {
        let mut body = Map::new();
        match self {
            Self::Allow { updated_input } => {
                let option_id = options
                    .iter()
                    .find(|o| o.is_allow())
                    .map_or("allow", |o| o.option_id.as_str());
                body.insert("outcome".into(), selected(option_id));
                body.insert("behavior".into(), json!("allow"));
                if let Some(input) = updated_input {
                    body.insert("updatedInput".into(), input.clone());
                }
            }
            Self::Deny { reason } => {
                let outcome = options
                    .iter()
                    .find(|o| o.is_reject())
                    .map_or_else(cancelled, |o| selected(&o.option_id));
                body.insert("outcome".into(), outcome);
                body.insert("behavior".into(), json!("deny"));
                body.insert("message".into(), json!(reason));
            }
            Self::Cancelled => {
                body.insert("outcome".into(), cancelled());
            }
        }
        Value::Object(body)
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Deny { .. } => "deny",
            Self::Cancelled => "cancelled",
        }
    }
}

fn selected(option_id: &str) -> Value {
    json!({ "outcome": "selected", "optionId": option_id })
}

fn cancelled() -> Value {
    json!({ "outcome": "cancelled" })
}
