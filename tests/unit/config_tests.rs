//! Unit tests for configuration parsing, validation and spawn resolution.

use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;

use agent_conduit::acp::spawner::SpawnConfig;
use agent_conduit::config::GlobalConfig;
use agent_conduit::AppError;

fn sample_toml() -> &'static str {
    r#"
[agents.claude]
command = "claude-code-acp"
args = ["--verbose"]
path_env = "CONDUIT_TEST_AGENT_PATH"

[agents.claude.env]
ACP_LOG = "debug"

[timeouts]
grace_seconds = 2

[client]
terminal = false

[logging]
traffic_log = "/tmp/conduit-traffic.jsonl"
"#
}

#[test]
fn parses_profiles_and_sections() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    let profile = config.agent("claude").expect("profile");
    assert_eq!(profile.command, "claude-code-acp");
    assert_eq!(profile.args, vec!["--verbose".to_owned()]);
    assert_eq!(profile.env.get("ACP_LOG").map(String::as_str), Some("debug"));

    assert_eq!(config.timeouts.grace(), Duration::from_secs(2));
    assert_eq!(config.timeouts.initialize(), Duration::from_secs(30));
    assert!(config.client.fs_read);
    assert!(config.client.fs_write);
    assert!(!config.client.terminal);
    assert_eq!(
        config.logging.traffic_log,
        Some(PathBuf::from("/tmp/conduit-traffic.jsonl"))
    );
    assert_eq!(config.sole_agent(), Some("claude"));
}

#[test]
fn unknown_profile_is_config_error() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");
    assert!(matches!(config.agent("gemini"), Err(AppError::Config(_))));
}

#[test]
fn sole_agent_is_none_with_several_profiles() {
    let config = GlobalConfig::from_toml_str(
        r#"
[agents.a]
command = "a"
[agents.b]
command = "b"
"#,
    )
    .expect("valid config");
    assert_eq!(config.sole_agent(), None);
}

#[test]
fn validation_rejects_bad_values() {
    for raw in [
        "[agents]\n",
        "[agents.a]\ncommand = \"  \"\n",
        "[agents.a]\ncommand = \"a\"\n[timeouts]\ngrace_seconds = 0\n",
        "[agents.a]\ncommand = \"a\"\n[timeouts]\ninitialize_seconds = 0\n",
    ] {
        let err = GlobalConfig::from_toml_str(raw).expect_err(raw);
        assert!(matches!(err, AppError::Config(_)), "{raw}: got {err:?}");
    }
}

#[test]
fn invalid_toml_is_config_error() {
    assert!(matches!(
        GlobalConfig::from_toml_str("agents = ["),
        Err(AppError::Config(_))
    ));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, sample_toml()).expect("write");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert!(config.agents.contains_key("claude"));

    assert!(matches!(
        GlobalConfig::load_from_path(dir.path().join("missing.toml")),
        Err(AppError::Config(_))
    ));
}

// ── Executable resolution ────────────────────────────────────────────────────

#[test]
#[serial]
fn path_env_overrides_command_when_set() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");
    let profile = config.agent("claude").expect("profile");

    std::env::set_var("CONDUIT_TEST_AGENT_PATH", "/opt/agents/claude");
    let spawn = SpawnConfig::from_profile("claude", profile, PathBuf::from("/work"));
    std::env::remove_var("CONDUIT_TEST_AGENT_PATH");

    assert_eq!(spawn.command, "/opt/agents/claude");
    assert_eq!(spawn.args, vec!["--verbose".to_owned()]);
    assert_eq!(spawn.cwd, PathBuf::from("/work"));
    assert_eq!(spawn.label, "claude");
}

#[test]
#[serial]
fn empty_or_unset_path_env_falls_back_to_command() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");
    let profile = config.agent("claude").expect("profile");

    std::env::remove_var("CONDUIT_TEST_AGENT_PATH");
    let unset = SpawnConfig::from_profile("claude", profile, PathBuf::from("/work"));
    assert_eq!(unset.command, "claude-code-acp");

    std::env::set_var("CONDUIT_TEST_AGENT_PATH", "  ");
    let empty = SpawnConfig::from_profile("claude", profile, PathBuf::from("/work"));
    std::env::remove_var("CONDUIT_TEST_AGENT_PATH");
    assert_eq!(empty.command, "claude-code-acp");
}
