#![forbid(unsafe_code)]

//! `agent-conduit`: drive a coding agent from the terminal.
//!
//! Spawns the configured agent, opens (or resumes) a session and streams the
//! session's events to stdout. Prompts come from the command line or, when
//! none is given, one per stdin line. Permission requests are answered by
//! `--permission-mode` or interactively.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::driver::acp_driver::{AcpTransport, AcpTransportConfig};
use agent_conduit::driver::{AgentTransport, TransportCommand, TransportEvent};
use agent_conduit::models::permission::PermissionRequest;
use agent_conduit::models::session::TransportStatus;
use agent_conduit::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// How permission requests are answered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum PermissionMode {
    /// Ask on the terminal (`y` allows, anything else denies).
    Ask,
    /// Allow everything.
    Allow,
    /// Deny everything.
    Deny,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Agent session transport", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Agent profile to launch. Optional when exactly one is configured.
    #[arg(long)]
    agent: Option<String>,

    /// Session working directory (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Resume this session id instead of creating a new session.
    #[arg(long)]
    resume: Option<String>,

    /// Permission policy.
    #[arg(long, value_enum, default_value_t = PermissionMode::Ask)]
    permission_mode: PermissionMode,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Prompt for a single turn. Without one, prompts are read from stdin.
    prompt: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    let agent = match args.agent.as_deref().or_else(|| config.sole_agent()) {
        Some(name) => name.to_owned(),
        None => {
            return Err(AppError::Config(
                "several agent profiles configured; pick one with --agent".into(),
            ))
        }
    };
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };
    info!(agent = %agent, cwd = %cwd.display(), "configuration loaded");

    // ── Connect ─────────────────────────────────────────
    let mut transport_config = AcpTransportConfig::from_global(&config, &agent, cwd)?;
    transport_config.resume = args.resume;
    let transport = AcpTransport::connect(transport_config).await?;
    eprintln!("session {}", transport.resolved_session_id());

    let mut events = transport.take_events().await?;
    let mut permissions = transport.take_permission_requests().await?;
    let mut lines = spawn_stdin_reader();

    let single_turn = !args.prompt.is_empty();
    if single_turn {
        transport
            .send(TransportCommand::Prompt {
                text: args.prompt.join(" "),
            })
            .await?;
    }

    // ── Event loop ──────────────────────────────────────
    let mut waiting: VecDeque<PermissionRequest> = VecDeque::new();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let finished = matches!(
                    event,
                    TransportEvent::Status(status) if status.is_terminal()
                ) || (single_turn && matches!(event, TransportEvent::TurnComplete { .. }));
                print_event(&event);
                if finished {
                    break;
                }
            }
            Some(request) = permissions.recv() => match args.permission_mode {
                PermissionMode::Allow => answer(&transport, &request, true).await,
                PermissionMode::Deny => answer(&transport, &request, false).await,
                PermissionMode::Ask => {
                    if waiting.is_empty() {
                        ask(&request);
                    }
                    waiting.push_back(request);
                }
            },
            line = lines.recv(), if stdin_open => {
                let Some(line) = line else {
                    stdin_open = false;
                    if !single_turn && waiting.is_empty() {
                        break;
                    }
                    continue;
                };
                if let Some(request) = waiting.pop_front() {
                    let allow = line.trim().eq_ignore_ascii_case("y");
                    answer(&transport, &request, allow).await;
                    if let Some(next) = waiting.front() {
                        ask(next);
                    }
                } else if let Some(command) = parse_command(&line) {
                    if let Err(err) = transport.send(command).await {
                        error!(%err, "command failed");
                    }
                }
            }
        }
    }

    transport.dispose().await;
    info!("agent-conduit shut down");
    Ok(())
}

/// Interpret one stdin line: `/cancel`, `/mode <id>` or a prompt.
fn parse_command(line: &str) -> Option<TransportCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "/cancel" {
        return Some(TransportCommand::Cancel);
    }
    if let Some(mode_id) = line.strip_prefix("/mode ") {
        return Some(TransportCommand::SetMode {
            mode_id: mode_id.trim().to_owned(),
        });
    }
    Some(TransportCommand::Prompt {
        text: line.to_owned(),
    })
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn ask(request: &PermissionRequest) {
    eprintln!(
        "\n[permission] {} wants to run with {} (allow? y/N)",
        request.tool_name, request.tool_input
    );
}

async fn answer(transport: &AcpTransport, request: &PermissionRequest, allow: bool) {
    let broker = transport.permissions();
    let result = if allow {
        broker.allow(&request.id, None).await
    } else {
        broker.deny(&request.id, "denied by user").await
    };
    if let Err(err) = result {
        warn!(request_id = %request.id, %err, "permission answer not delivered");
    }
}

fn print_event(event: &TransportEvent) {
    let mut out = std::io::stdout().lock();
    let _ = match event {
        TransportEvent::Text { conversation, text } if conversation.is_primary() => {
            write!(out, "{text}")
        }
        TransportEvent::Text { conversation, text } => writeln!(out, "[{conversation}] {text}"),
        TransportEvent::Thought { text, .. } => writeln!(out, "(thinking) {text}"),
        TransportEvent::UserText { text, .. } => writeln!(out, "> {text}"),
        TransportEvent::ToolCall { call, .. } => {
            writeln!(out, "\n[tool] {} ({:?})", call.title, call.status)
        }
        TransportEvent::ToolCallUpdated { call, .. } => {
            writeln!(out, "[tool] {} -> {:?}", call.title, call.status)
        }
        TransportEvent::Plan { entries } => {
            let mut result = writeln!(out, "[plan]");
            for entry in entries {
                result = result.and_then(|()| writeln!(out, "  - {} ({})", entry.content, entry.status));
            }
            result
        }
        TransportEvent::ModeChanged { mode_id } => writeln!(out, "[mode] {mode_id}"),
        TransportEvent::AvailableCommands { commands } => writeln!(
            out,
            "[commands] {}",
            commands
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        TransportEvent::SubagentStarted {
            conversation,
            title,
            ..
        } => writeln!(out, "[subagent {conversation}] started: {title}"),
        TransportEvent::SubagentFinished {
            conversation,
            status,
            ..
        } => writeln!(out, "[subagent {conversation}] finished: {status:?}"),
        TransportEvent::TurnComplete { stop_reason } => writeln!(out, "\n[done: {stop_reason}]"),
        TransportEvent::Error { message } => writeln!(out, "[error] {message}"),
        TransportEvent::Status(status) => match status {
            TransportStatus::Error => writeln!(out, "[status] {status}"),
            _ => Ok(()),
        },
    };
    let _ = out.flush();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
