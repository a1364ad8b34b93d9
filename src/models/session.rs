//! Session handle, negotiated capabilities and transport status.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capabilities this client offers the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientCapabilities {
    /// Serve `fs/read_text_file`.
    #[serde(default = "default_true")]
    pub fs_read: bool,
    /// Serve `fs/write_text_file`.
    #[serde(default = "default_true")]
    pub fs_write: bool,
    /// Serve `terminal/*`.
    #[serde(default = "default_true")]
    pub terminal: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            fs_read: true,
            fs_write: true,
            terminal: true,
        }
    }
}

/// Authentication method advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    /// Method id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of the `initialize` exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedCapabilities {
    /// Protocol version the agent settled on.
    pub protocol_version: u32,
    /// Raw agent capability object (`loadSession`, `promptCapabilities`, …).
    #[serde(default)]
    pub agent_capabilities: Value,
    /// Authentication methods the agent accepts.
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
}

impl NegotiatedCapabilities {
    /// Whether the agent supports `session/load`.
    #[must_use]
    pub fn supports_load_session(&self) -> bool {
        self.agent_capabilities
            .get("loadSession")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A session mode the agent offers (e.g. `default`, `plan`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    /// Mode id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One live conversation with an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    /// Id assigned at creation.
    pub session_id: String,
    /// Id to use when resuming; equal to `session_id` unless the agent
    /// reassigned it during `session/load`.
    pub resolved_session_id: String,
    /// Capabilities negotiated at `initialize`.
    pub capabilities: NegotiatedCapabilities,
    /// Currently active mode.
    pub current_mode: Option<String>,
    /// Modes the agent advertised.
    pub available_modes: Vec<SessionMode>,
}

/// Connection status observed by the view layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    /// Spawning the process or performing the handshake.
    Connecting,
    /// Session established.
    Connected,
    /// Ended by an explicit disconnect.
    Disconnected,
    /// Ended by a failure (process exit, broken stream).
    Error,
}

impl TransportStatus {
    /// Whether `self → next` is a legal transition.
    ///
    /// Status only moves forward, except that `error → connecting` is
    /// allowed for reconnect attempts.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Connecting,
                Self::Connected | Self::Disconnected | Self::Error
            ) | (Self::Connected, Self::Disconnected | Self::Error)
                | (Self::Error, Self::Connecting)
        )
    }

    /// `disconnected` or `error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl Display for TransportStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}
