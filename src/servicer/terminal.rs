//! Terminal table.
//!
//! A terminal is a child process the agent asked the client to run. Its
//! stdout and stderr are collected into one [`OutputBuffer`]; a monitor task
//! owns the [`Child`] and publishes the exit status once both pipes have
//! drained. Every terminal stays in the table, keyed by an opaque id, until it
//! is released explicitly or swept by [`TerminalTable::release_all`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// Upper bound on waiting for output pipes after the process exits; a
/// backgrounded grandchild can keep them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accumulated output of one terminal, truncated from the front once it
/// exceeds its byte limit.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    /// Create a buffer retaining at most `limit` bytes (unbounded if `None`).
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            data: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `chunk`, dropping the oldest output beyond the limit.
    ///
    /// The cut always lands on a char boundary, so the retained text may be
    /// a few bytes shorter than the limit.
    pub fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        let Some(limit) = self.limit else {
            return;
        };
        if self.data.len() <= limit {
            return;
        }
        let mut cut = self.data.len() - limit;
        while !self.data.is_char_boundary(cut) {
            cut += 1;
        }
        self.data.drain(..cut);
        self.truncated = true;
    }

    /// Retained output.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.data
    }

    /// Whether output was ever dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// How a terminal's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExit {
    /// Exit code for a normal exit.
    pub exit_code: Option<i32>,
    /// Signal name when killed by a signal.
    pub signal: Option<String>,
}

impl TerminalExit {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                exit_code: status.code(),
                signal: signal_name(&status),
            },
            Err(err) => {
                warn!(%err, "terminal wait failed");
                Self {
                    exit_code: None,
                    signal: None,
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|raw| {
        nix::sys::signal::Signal::try_from(raw)
            .map_or_else(|_| raw.to_string(), |sig| sig.as_str().to_owned())
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// What to run in a new terminal.
#[derive(Debug, Clone, Default)]
pub struct TerminalSpec {
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; inherits the client's when `None`.
    pub cwd: Option<PathBuf>,
    /// Retained output limit in bytes.
    pub output_byte_limit: Option<usize>,
}

/// Point-in-time view of a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSnapshot {
    /// Retained output.
    pub output: String,
    /// Whether output was dropped to honour the byte limit.
    pub truncated: bool,
    /// Exit status, once exited.
    pub exit: Option<TerminalExit>,
}

#[derive(Debug)]
struct Terminal {
    output: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<TerminalExit>>,
    kill_tx: mpsc::Sender<()>,
}

impl Terminal {
    fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    async fn wait(&self) -> TerminalExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or(TerminalExit {
            exit_code: None,
            signal: None,
        })
    }
}

/// Terminals created for one connection, keyed by terminal id.
#[derive(Debug, Default, Clone)]
pub struct TerminalTable {
    terminals: Arc<Mutex<HashMap<String, Arc<Terminal>>>>,
}

impl TerminalTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `spec` and return the new terminal id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be started.
    pub async fn create(&self, spec: TerminalSpec) -> Result<String> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to start terminal `{}`: {err}", spec.command))
        })?;

        let id = format!("term_{}", Uuid::new_v4().simple());
        let output = Arc::new(Mutex::new(OutputBuffer::new(spec.output_byte_limit)));

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(stderr, Arc::clone(&output))));
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor_terminal(id.clone(), child, kill_rx, exit_tx, pumps));

        info!(terminal_id = %id, command = %spec.command, "terminal created");
        self.terminals.lock().await.insert(
            id.clone(),
            Arc::new(Terminal {
                output,
                exit_rx,
                kill_tx,
            }),
        );
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Arc<Terminal>> {
        self.terminals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::TerminalNotFound(id.to_owned()))
    }

    /// Current output and exit status.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn output(&self, id: &str) -> Result<TerminalSnapshot> {
        let terminal = self.get(id).await?;
        let exit = terminal.exit_rx.borrow().clone();
        let (output, truncated) = {
            let buffer = terminal.output.lock().await;
            (buffer.text().to_owned(), buffer.truncated())
        };
        Ok(TerminalSnapshot {
            output,
            truncated,
            exit,
        })
    }

    /// Wait for the terminal's process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn wait_for_exit(&self, id: &str) -> Result<TerminalExit> {
        let terminal = self.get(id).await?;
        Ok(terminal.wait().await)
    }

    /// Kill the terminal's process; the terminal stays queryable.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or released ids.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let terminal = self.get(id).await?;
        terminal.kill();
        debug!(terminal_id = id, "terminal kill requested");
        Ok(())
    }

    /// Kill the process if still running and forget the terminal.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TerminalNotFound`] for unknown or already
    /// released ids.
    pub async fn release(&self, id: &str) -> Result<()> {
        let terminal = self
            .terminals
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| AppError::TerminalNotFound(id.to_owned()))?;
        terminal.kill();
        info!(terminal_id = id, "terminal released");
        Ok(())
    }

    /// Release every terminal. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<_> = self.terminals.lock().await.drain().collect();
        for (_, terminal) in &drained {
            terminal.kill();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "terminals swept");
        }
        drained.len()
    }

    /// Number of live terminals.
    pub async fn len(&self) -> usize {
        self.terminals.lock().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.terminals.lock().await.is_empty()
    }
}

async fn pump_output<R>(mut pipe: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; 8192];
    let mut pending = Vec::new();
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let chunk = take_utf8_prefix(&mut pending);
                if !chunk.is_empty() {
                    output.lock().await.push(&chunk);
                }
            }
            Err(err) => {
                debug!(%err, "terminal pipe read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        output
            .lock()
            .await
            .push(&String::from_utf8_lossy(&pending));
    }
}

/// Decode the longest complete prefix of `pending`, leaving an incomplete
/// trailing character in place for the next read. Invalid sequences become
/// U+FFFD.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = pending.len();
                break;
            }
            Err(err) => {
                let valid_end = start + err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[start..valid_end]));
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    text
}

async fn monitor_terminal(
    id: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<TerminalExit>>,
    pumps: Vec<tokio::task::JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx.recv() => {
            if let Err(err) = child.start_kill() {
                debug!(terminal_id = %id, %err, "terminal kill failed");
            }
            child.wait().await
        }
    };

    for pump in pumps {
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(terminal_id = %id, "terminal pipe still open after exit");
        }
    }

    let exit = TerminalExit::from_status(status);
    debug!(terminal_id = %id, exit_code = exit.exit_code, "terminal exited");
    exit_tx.send_replace(Some(exit));
}
