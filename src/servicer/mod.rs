//! Client capability servicer.
//!
//! Answers the requests an agent makes of the client: reading and writing
//! text files and running terminals. Handlers are registered on an
//! [`RpcConnection`] only for the capabilities the client advertised, so a
//! disabled capability is answered with `method not found`.

pub mod terminal;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::acp::connection::RpcConnection;
use crate::models::session::ClientCapabilities;
use crate::servicer::terminal::{TerminalSpec, TerminalTable};
use crate::{AppError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFileParams {
    path: PathBuf,
    line: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTextFileParams {
    path: PathBuf,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EnvVariable {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTerminalParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<EnvVariable>,
    cwd: Option<PathBuf>,
    output_byte_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalIdParams {
    terminal_id: String,
}

fn decode<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| AppError::InvalidParams(format!("{method}: {e}")))
}

fn require_absolute(method: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(AppError::InvalidParams(format!(
            "{method}: path must be absolute: {}",
            path.display()
        )))
    }
}

fn map_fs_error(path: &Path, err: &std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::NotFound(format!("file not found: {}", path.display()))
    } else {
        AppError::Io(format!("{}: {err}", path.display()))
    }
}

/// Select `limit` lines starting at 1-based `line`, keeping line endings.
fn slice_lines(text: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return text.to_owned();
    }
    let skip = line.unwrap_or(1).saturating_sub(1);
    let take = limit.unwrap_or(usize::MAX);
    text.split_inclusive('\n').skip(skip).take(take).collect()
}

/// Serves `fs/*` and `terminal/*` requests for one connection.
#[derive(Debug, Clone)]
pub struct CapabilityServicer {
    capabilities: ClientCapabilities,
    terminals: TerminalTable,
}

impl CapabilityServicer {
    /// Create a servicer offering `capabilities`.
    #[must_use]
    pub fn new(capabilities: ClientCapabilities) -> Self {
        Self {
            capabilities,
            terminals: TerminalTable::new(),
        }
    }

    /// Terminal table backing the `terminal/*` methods.
    #[must_use]
    pub fn terminals(&self) -> &TerminalTable {
        &self.terminals
    }

    /// Register a handler for every enabled capability on `conn`.
    pub async fn register(&self, conn: &RpcConnection) {
        if self.capabilities.fs_read {
            let this = self.clone();
            conn.on_request("fs/read_text_file", move |params| {
                let this = this.clone();
                async move { this.read_text_file(params).await }
            })
            .await;
        }
        if self.capabilities.fs_write {
            let this = self.clone();
            conn.on_request("fs/write_text_file", move |params| {
                let this = this.clone();
                async move { this.write_text_file(params).await }
            })
            .await;
        }
        if self.capabilities.terminal {
            let this = self.clone();
            conn.on_request("terminal/create", move |params| {
                let this = this.clone();
                async move { this.create_terminal(params).await }
            })
            .await;
            let this = self.clone();
            conn.on_request("terminal/output", move |params| {
                let this = this.clone();
                async move { this.terminal_output(params).await }
            })
            .await;
            let this = self.clone();
            conn.on_request("terminal/wait_for_exit", move |params| {
                let this = this.clone();
                async move { this.wait_for_terminal_exit(params).await }
            })
            .await;
            let this = self.clone();
            conn.on_request("terminal/kill", move |params| {
                let this = this.clone();
                async move { this.kill_terminal(params).await }
            })
            .await;
            let this = self.clone();
            conn.on_request("terminal/release", move |params| {
                let this = this.clone();
                async move { this.release_terminal(params).await }
            })
            .await;
        }
    }

    /// `fs/read_text_file`: `{path, line?, limit?}` → `{content}`.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidParams`] for malformed params or a relative path.
    /// - [`AppError::NotFound`] if the file does not exist.
    /// - [`AppError::Io`] for other read failures.
    pub async fn read_text_file(&self, params: Value) -> Result<Value> {
        let params: ReadTextFileParams = decode("fs/read_text_file", params)?;
        require_absolute("fs/read_text_file", &params.path)?;

        let text = tokio::fs::read_to_string(&params.path)
            .await
            .map_err(|e| map_fs_error(&params.path, &e))?;
        debug!(path = %params.path.display(), bytes = text.len(), "fs: read");
        Ok(json!({ "content": slice_lines(&text, params.line, params.limit) }))
    }

    /// `fs/write_text_file`: `{path, content}`; creates missing parent
    /// directories.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidParams`] for malformed params or a relative path.
    /// - [`AppError::Io`] for write failures.
    pub async fn write_text_file(&self, params: Value) -> Result<Value> {
        let params: WriteTextFileParams = decode("fs/write_text_file", params)?;
        require_absolute("fs/write_text_file", &params.path)?;

        if let Some(parent) = params.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_fs_error(parent, &e))?;
        }
        tokio::fs::write(&params.path, params.content.as_bytes())
            .await
            .map_err(|e| map_fs_error(&params.path, &e))?;
        debug!(path = %params.path.display(), bytes = params.content.len(), "fs: wrote");
        Ok(json!({}))
    }

    /// `terminal/create` → `{terminalId}`.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidParams`] for malformed params or a relative cwd.
    /// - [`AppError::Spawn`] if the command cannot be started.
    pub async fn create_terminal(&self, params: Value) -> Result<Value> {
        let params: CreateTerminalParams = decode("terminal/create", params)?;
        if let Some(cwd) = &params.cwd {
            require_absolute("terminal/create", cwd)?;
        }
        let id = self
            .terminals
            .create(TerminalSpec {
                command: params.command,
                args: params.args,
                env: params.env.into_iter().map(|v| (v.name, v.value)).collect(),
                cwd: params.cwd,
                output_byte_limit: params.output_byte_limit,
            })
            .await?;
        Ok(json!({ "terminalId": id }))
    }

    /// `terminal/output` → `{output, truncated, exitStatus?}`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn terminal_output(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = decode("terminal/output", params)?;
        let snapshot = self.terminals.output(&params.terminal_id).await?;
        Ok(json!({
            "output": snapshot.output,
            "truncated": snapshot.truncated,
            "exitStatus": snapshot.exit,
        }))
    }

    /// `terminal/wait_for_exit` → `{exitCode, signal}`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn wait_for_terminal_exit(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = decode("terminal/wait_for_exit", params)?;
        let exit = self.terminals.wait_for_exit(&params.terminal_id).await?;
        serde_json::to_value(exit).map_err(|e| AppError::Io(e.to_string()))
    }

    /// `terminal/kill`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn kill_terminal(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = decode("terminal/kill", params)?;
        self.terminals.kill(&params.terminal_id).await?;
        Ok(json!({}))
    }

    /// `terminal/release`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn release_terminal(&self, params: Value) -> Result<Value> {
        let params: TerminalIdParams = decode("terminal/release", params)?;
        self.terminals.release(&params.terminal_id).await?;
        Ok(json!({}))
    }

    /// Release every terminal; called on disconnect.
    pub async fn release_all(&self) -> usize {
        self.terminals.release_all().await
    }
}
