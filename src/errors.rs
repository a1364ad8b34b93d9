//! Error types shared across the transport layer.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every transport failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Agent executable missing or not runnable.
    Spawn(String),
    /// A single inbound line could not be decoded as JSON.
    Decode(String),
    /// Protocol ordering or envelope violation on the local side.
    Protocol(String),
    /// Inbound request parameters failed validation.
    InvalidParams(String),
    /// The agent answered a request with a JSON-RPC error.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
    /// The connection closed before the operation could complete.
    ConnectionClosed(String),
    /// Stream-level failure writing to or reading from the agent.
    Acp(String),
    /// Terminal id is unknown or already released.
    TerminalNotFound(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Single-use resource has already been consumed or resolved.
    AlreadyConsumed(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error means the underlying connection is gone.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::TerminalNotFound(msg) => write!(f, "terminal not found: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyConsumed(msg) => write!(f, "already consumed: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
