//! Global configuration parsing and validation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::ClientCapabilities;
use crate::{AppError, Result};

/// How to launch one agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentProfile {
    /// Executable name (resolved on `PATH`) or path.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged over the ambient environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment variable that, when set, holds the executable path and
    /// takes precedence over `command`.
    #[serde(default)]
    pub path_env: Option<String>,
}

/// Timeout values (seconds) for process and handshake lifecycle.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Grace period between SIGTERM and kill on disconnect.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Upper bound on the `initialize` exchange.
    #[serde(default = "default_initialize_seconds")]
    pub initialize_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
            initialize_seconds: default_initialize_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Grace period as a [`Duration`].
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    /// Initialize timeout as a [`Duration`].
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_secs(self.initialize_seconds)
    }
}

fn default_grace_seconds() -> u64 {
    5
}

fn default_initialize_seconds() -> u64 {
    30
}

/// Protocol traffic logging.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// File receiving one JSON object per protocol line; disabled when unset.
    #[serde(default)]
    pub traffic_log: Option<PathBuf>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent profiles keyed by name.
    pub agents: HashMap<String, AgentProfile>,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Capabilities offered to agents.
    #[serde(default)]
    pub client: ClientCapabilities,
    /// Traffic logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up an agent profile by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no profile has that name.
    pub fn agent(&self, name: &str) -> Result<&AgentProfile> {
        self.agents
            .get(name)
            .ok_or_else(|| AppError::Config(format!("unknown agent profile `{name}`")))
    }

    /// Name of the only profile, when exactly one is configured.
    #[must_use]
    pub fn sole_agent(&self) -> Option<&str> {
        let mut names = self.agents.keys();
        match (names.next(), names.next()) {
            (Some(name), None) => Some(name.as_str()),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(AppError::Config(
                "at least one [agents.<name>] profile is required".into(),
            ));
        }

        if let Some((name, _)) = self
            .agents
            .iter()
            .find(|(_, profile)| profile.command.trim().is_empty())
        {
            return Err(AppError::Config(format!(
                "agents.{name}.command must not be empty"
            )));
        }

        if self.timeouts.grace_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.grace_seconds must be greater than zero".into(),
            ));
        }

        if self.timeouts.initialize_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.initialize_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
