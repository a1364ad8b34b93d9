//! Process host behaviour against plain shell commands.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};

use agent_conduit::acp::spawner::{spawn_agent, SpawnConfig};
use agent_conduit::traffic::TrafficLog;
use agent_conduit::AppError;

use super::test_helpers::STEP;

fn sh(script: &str) -> SpawnConfig {
    SpawnConfig {
        label: "sh".into(),
        command: "sh".into(),
        args: vec!["-c".into(), script.into()],
        env: BTreeMap::new(),
        cwd: std::env::temp_dir(),
    }
}

#[tokio::test]
async fn exit_code_is_observed() {
    let process = spawn_agent(&sh("exit 7"), TrafficLog::disabled("sh"))
        .await
        .expect("spawn");

    let exit = tokio::time::timeout(STEP, process.handle.wait_exit())
        .await
        .expect("exit in time");
    assert_eq!(exit.code, Some(7));
    assert_eq!(process.handle.try_exit(), Some(exit));
}

#[tokio::test]
async fn missing_executable_is_spawn_error() {
    let mut config = sh("");
    config.command = "/definitely/not/here".into();
    let err = spawn_agent(&config, TrafficLog::disabled("missing"))
        .await
        .expect_err("spawn");
    assert!(matches!(err, AppError::Spawn(_)), "got {err:?}");
}

#[tokio::test]
async fn terminate_stops_a_cooperative_process() {
    let process = spawn_agent(&sh("exec sleep 30"), TrafficLog::disabled("sh"))
        .await
        .expect("spawn");

    let started = Instant::now();
    let exit = process.handle.terminate(Duration::from_secs(5)).await;
    assert_eq!(exit.code, None, "ended by signal");
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// A process ignoring SIGTERM is killed once the grace period elapses.
#[tokio::test]
async fn terminate_escalates_after_grace() {
    let process = spawn_agent(
        &sh("trap '' TERM; echo ready; exec sleep 30"),
        TrafficLog::disabled("sh"),
    )
    .await
    .expect("spawn");

    let mut stdout = BufReader::new(process.stdout).lines();
    let ready = tokio::time::timeout(STEP, stdout.next_line())
        .await
        .expect("ready in time")
        .expect("read");
    assert_eq!(ready.as_deref(), Some("ready"));

    let grace = Duration::from_millis(300);
    let started = Instant::now();
    let exit = tokio::time::timeout(STEP, process.handle.terminate(grace))
        .await
        .expect("terminated in time");
    assert!(started.elapsed() >= grace);
    assert_eq!(exit.code, None);
}

#[tokio::test]
async fn dropping_every_handle_kills_the_process() {
    let process = spawn_agent(&sh("exec sleep 30"), TrafficLog::disabled("sh"))
        .await
        .expect("spawn");
    let mut exit = process.handle.exit_watch();
    drop(process);

    tokio::time::timeout(STEP, exit.wait_for(Option::is_some))
        .await
        .expect("killed in time")
        .expect("monitor alive");
}

#[tokio::test]
async fn stderr_and_lifecycle_reach_the_traffic_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("traffic.jsonl");
    let traffic = TrafficLog::open("sh", &path).await.expect("open");

    let process = spawn_agent(&sh("echo oops >&2; exit 0"), traffic.clone())
        .await
        .expect("spawn");
    tokio::time::timeout(STEP, process.handle.wait_exit())
        .await
        .expect("exit in time");

    let deadline = Instant::now() + STEP;
    let fds = loop {
        traffic.flush().await;
        let fds: Vec<String> = std::fs::read_to_string(&path)
            .expect("read log")
            .lines()
            .map(|line| {
                let entry: serde_json::Value = serde_json::from_str(line).expect("json");
                entry["fd"].as_str().unwrap_or_default().to_owned()
            })
            .collect();
        if fds.iter().any(|fd| fd == "STDERR") || Instant::now() > deadline {
            break fds;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    traffic.close().await;

    assert_eq!(fds.first().map(String::as_str), Some("STARTUP"));
    assert!(fds.iter().any(|fd| fd == "STDERR"), "{fds:?}");
    assert!(fds.iter().any(|fd| fd == "EXIT"), "{fds:?}");
}
