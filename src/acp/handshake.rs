//! ACP session handshake.
//!
//! After the channel is up the client performs, in order:
//!
//! 1. **`initialize`**: protocol version, client capabilities and client
//!    info go out; the agent's capabilities and auth methods come back
//!    ([`RpcConnection::initialize`] drives this using
//!    [`initialize_params`] and [`parse_negotiated`]).
//! 2. **`session/new`** or **`session/load`**: establishes the
//!    [`SessionHandle`] ([`new_session`], [`load_session`]).
//!
//! The remaining helpers build the parameter objects for the per-turn
//! methods (`session/prompt`, `session/cancel`, `session/set_mode`).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::acp::connection::RpcConnection;
use crate::models::session::{
    ClientCapabilities, NegotiatedCapabilities, SessionHandle, SessionMode,
};
use crate::{AppError, Result};

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name reported in `clientInfo`.
pub const CLIENT_NAME: &str = "agent-conduit";

/// Build the `initialize` request parameters.
#[must_use]
pub fn initialize_params(capabilities: ClientCapabilities) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": {
                "readTextFile": capabilities.fs_read,
                "writeTextFile": capabilities.fs_write,
            },
            "terminal": capabilities.terminal,
        },
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parse the `initialize` result.
///
/// # Errors
///
/// - [`AppError::Protocol`] if the result is not an object or the agent
///   settled on a protocol version this client does not speak.
pub fn parse_negotiated(result: Value) -> Result<NegotiatedCapabilities> {
    let negotiated: NegotiatedCapabilities = serde_json::from_value(result)
        .map_err(|e| AppError::Protocol(format!("invalid initialize result: {e}")))?;

    if negotiated.protocol_version == 0 || negotiated.protocol_version > PROTOCOL_VERSION {
        return Err(AppError::Protocol(format!(
            "unsupported protocol version {} (client speaks {PROTOCOL_VERSION})",
            negotiated.protocol_version
        )));
    }
    Ok(negotiated)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeState {
    current_mode_id: Option<String>,
    #[serde(default)]
    available_modes: Vec<SessionMode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResult {
    session_id: Option<String>,
    #[serde(default)]
    modes: Option<ModeState>,
}

fn parse_session_result(result: Value) -> Result<SessionResult> {
    if result.is_null() {
        return Ok(SessionResult::default());
    }
    serde_json::from_value(result)
        .map_err(|e| AppError::Protocol(format!("invalid session result: {e}")))
}

/// Agents require an absolute working directory.
fn absolute_cwd(cwd: &Path) -> Result<PathBuf> {
    if cwd.is_absolute() {
        return Ok(cwd.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(cwd))
}

/// Create a fresh session with `session/new`.
///
/// # Errors
///
/// Propagates call failures; returns [`AppError::Protocol`] if the agent
/// omits the session id.
pub async fn new_session(
    conn: &RpcConnection,
    cwd: &Path,
    capabilities: NegotiatedCapabilities,
) -> Result<SessionHandle> {
    let cwd = absolute_cwd(cwd)?;
    let result = conn
        .call("session/new", json!({ "cwd": cwd, "mcpServers": [] }))
        .await?;
    let parsed = parse_session_result(result)?;
    let session_id = parsed
        .session_id
        .ok_or_else(|| AppError::Protocol("session/new result has no sessionId".into()))?;
    let modes = parsed.modes.unwrap_or_default();

    info!(session_id = %session_id, cwd = %cwd.display(), "handshake: session created");
    Ok(SessionHandle {
        resolved_session_id: session_id.clone(),
        session_id,
        capabilities,
        current_mode: modes.current_mode_id,
        available_modes: modes.available_modes,
    })
}

/// Resume an existing session with `session/load`.
///
/// The agent replays the conversation as `session/update` notifications
/// before answering; the handler for those must already be registered.
///
/// # Errors
///
/// - [`AppError::Protocol`] if the agent did not advertise `loadSession`.
/// - Propagates call failures.
pub async fn load_session(
    conn: &RpcConnection,
    session_id: &str,
    cwd: &Path,
    capabilities: NegotiatedCapabilities,
) -> Result<SessionHandle> {
    if !capabilities.supports_load_session() {
        return Err(AppError::Protocol(
            "agent does not support session/load".into(),
        ));
    }
    let cwd = absolute_cwd(cwd)?;
    let result = conn
        .call(
            "session/load",
            json!({ "sessionId": session_id, "cwd": cwd, "mcpServers": [] }),
        )
        .await?;
    let parsed = parse_session_result(result)?;
    let resolved = parsed
        .session_id
        .unwrap_or_else(|| session_id.to_owned());
    let modes = parsed.modes.unwrap_or_default();

    if resolved != session_id {
        debug!(session_id, resolved = %resolved, "handshake: agent reassigned session id on load");
    }
    info!(session_id, "handshake: session resumed");
    Ok(SessionHandle {
        session_id: session_id.to_owned(),
        resolved_session_id: resolved,
        capabilities,
        current_mode: modes.current_mode_id,
        available_modes: modes.available_modes,
    })
}

/// `session/prompt` parameters for a plain-text turn.
#[must_use]
pub fn prompt_params(session_id: &str, text: &str) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [{ "type": "text", "text": text }],
    })
}

/// `session/cancel` parameters.
#[must_use]
pub fn cancel_params(session_id: &str) -> Value {
    json!({ "sessionId": session_id })
}

/// `session/set_mode` parameters.
#[must_use]
pub fn set_mode_params(session_id: &str, mode_id: &str) -> Value {
    json!({ "sessionId": session_id, "modeId": mode_id })
}

/// Stop reason from a `session/prompt` result; `end_turn` when absent.
#[must_use]
pub fn stop_reason(result: &Value) -> String {
    result
        .get("stopReason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn")
        .to_owned()
}
