//! Agent process host.
//!
//! Spawns an agent executable with piped stdio and hands its stdin/stdout to
//! the caller. Ownership of the [`Child`] moves into a monitor task, which:
//! - waits for the process to exit and publishes an [`ExitInfo`] on a
//!   [`watch`] channel, and
//! - kills the process when asked, or when every [`AgentProcessHandle`]
//!   clone has been dropped.
//!
//! The process is therefore never leaked: `kill_on_drop(true)` covers
//! runtime shutdown and the monitor covers handle drop.
//!
//! Stderr is drained on its own task into `tracing` and the traffic log.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::AgentProfile;
use crate::traffic::{Direction, TrafficLog};
use crate::{AppError, Result};

// ── Configuration ────────────────────────────────────────────────────────────

/// How to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Label used in logs (normally the profile name).
    pub label: String,
    /// Executable name or path.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Environment overrides applied on top of the ambient environment.
    pub env: BTreeMap<String, String>,
    /// Session working directory; also the child's cwd when it exists.
    pub cwd: PathBuf,
}

impl SpawnConfig {
    /// Build a spawn configuration from an agent profile.
    ///
    /// When the profile names a `path_env` variable and that variable is set
    /// to a non-empty value, its value replaces `command`.
    #[must_use]
    pub fn from_profile(label: &str, profile: &AgentProfile, cwd: PathBuf) -> Self {
        let command = profile
            .path_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| profile.command.clone());

        Self {
            label: label.to_owned(),
            command,
            args: profile.args.clone(),
            env: profile.env.clone(),
            cwd,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Exit tracking ────────────────────────────────────────────────────────────

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

impl ExitInfo {
    fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                Self { code, reason }
            }
            Err(err) => Self {
                code: None,
                reason: format!("wait error: {err}"),
            },
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Control handle for a running agent process.
///
/// Cloneable; the process is killed once every clone is dropped.
#[derive(Debug, Clone)]
pub struct AgentProcessHandle {
    label: String,
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl AgentProcessHandle {
    /// OS process id, if the process was still running at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Watch channel that becomes `Some` when the process exits.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Exit information, if the process has already exited.
    #[must_use]
    pub fn try_exit(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Wait for the process to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = match rx.wait_for(Option::is_some).await {
            Ok(info) => info.clone().unwrap_or_else(monitor_gone),
            Err(_) => monitor_gone(),
        };
        info
    }

    /// Ask the monitor to kill the process immediately.
    pub fn kill(&self) {
        // A full channel means a kill is already queued.
        let _ = self.kill_tx.try_send(());
    }

    /// Graceful stop: SIGTERM, then kill once `grace` has elapsed.
    ///
    /// Returns immediately if the process already exited.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.try_exit() {
            return info;
        }
        self.signal_terminate();
        if let Ok(info) = tokio::time::timeout(grace, self.wait_exit()).await {
            return info;
        }
        warn!(
            agent = %self.label,
            grace_ms = grace.as_millis(),
            "agent ignored SIGTERM within grace period, killing"
        );
        self.kill();
        self.wait_exit().await
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            Some(raw) => {
                if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    debug!(agent = %self.label, %err, "SIGTERM delivery failed");
                }
            }
            None => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        self.kill();
    }
}

fn monitor_gone() -> ExitInfo {
    ExitInfo {
        code: None,
        reason: "process monitor stopped".into(),
    }
}

/// A freshly spawned agent: control handle plus the stdio pipes.
#[derive(Debug)]
pub struct AgentProcess {
    /// Control handle.
    pub handle: AgentProcessHandle,
    /// Agent's stdin; the writer task takes ownership.
    pub stdin: ChildStdin,
    /// Agent's stdout; the reader task takes ownership.
    pub stdout: ChildStdout,
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the agent process described by `config`.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] if the executable cannot be started or its
/// stdio cannot be captured.
pub async fn spawn_agent(config: &SpawnConfig, traffic: TrafficLog) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // The session cwd is only a hint to the agent; it need not exist locally.
    if config.cwd.is_dir() {
        cmd.current_dir(&config.cwd);
    } else {
        debug!(agent = %config.label, cwd = %config.cwd.display(), "cwd missing, inheriting ours");
    }

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn `{}`: {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child.stderr.take();

    let pid = child.id();
    traffic
        .record(Direction::Startup, &config.command_line())
        .await;
    info!(
        agent = %config.label,
        pid,
        command = %config.command,
        cwd = %config.cwd.display(),
        "agent process spawned"
    );

    if let Some(stderr) = stderr {
        tokio::spawn(drain_stderr(config.label.clone(), stderr, traffic.clone()));
    }

    let (kill_tx, kill_rx) = mpsc::channel(1);
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(monitor_exit(
        config.label.clone(),
        child,
        kill_rx,
        exit_tx,
        traffic,
    ));

    Ok(AgentProcess {
        handle: AgentProcessHandle {
            label: config.label.clone(),
            pid,
            kill_tx,
            exit_rx,
        },
        stdin,
        stdout,
    })
}

/// Own the child until it exits; kill it on request or when all handles drop.
async fn monitor_exit(
    label: String,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    traffic: TrafficLog,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = kill_rx.recv() => {
            if request.is_none() {
                debug!(agent = %label, "all process handles dropped, killing agent");
            }
            if let Err(err) = child.start_kill() {
                debug!(agent = %label, %err, "kill failed, process may already be gone");
            }
            child.wait().await
        }
    };

    let info = ExitInfo::from_wait(status);
    traffic.record(Direction::Exit, &info.reason).await;
    info!(agent = %label, code = info.code, reason = %info.reason, "agent process exited");
    exit_tx.send_replace(Some(info));
}

async fn drain_stderr(label: String, stderr: ChildStderr, traffic: TrafficLog) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(agent = %label, line = %line, "agent stderr");
                traffic.record(Direction::Stderr, &line).await;
            }
            Ok(None) => break,
            Err(err) => {
                debug!(agent = %label, %err, "agent stderr read failed");
                break;
            }
        }
    }
}
