//! Unit tests for the protocol traffic log.

use serde_json::{json, Value};

use agent_conduit::traffic::{entry_for, Direction, TrafficLog};

fn read_entries(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("read log")
        .lines()
        .map(|line| serde_json::from_str(line).expect("each record is json"))
        .collect()
}

#[test]
fn json_lines_are_embedded_structurally() {
    let entry = entry_for(Direction::Stdout, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
    assert_eq!(entry["fd"], "STDOUT");
    assert_eq!(entry["type"], "json");
    assert_eq!(entry["json"]["id"], 1);
    assert!(entry["time"].is_string());
}

#[test]
fn other_lines_are_recorded_as_text() {
    let entry = entry_for(Direction::Stderr, "warning: something");
    assert_eq!(entry["fd"], "STDERR");
    assert_eq!(entry["type"], "text");
    assert_eq!(entry["text"], "warning: something");
}

#[tokio::test]
async fn records_are_appended_one_per_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("traffic.jsonl");

    let log = TrafficLog::open("test", &path).await.expect("open");
    log.record(Direction::Startup, "mock-agent --flag").await;
    log.record(Direction::Stdin, &json!({ "jsonrpc": "2.0", "method": "x" }).to_string())
        .await;
    log.record(Direction::Exit, "exit code 0").await;
    log.close().await;

    let entries = read_entries(&path);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["fd"], "STARTUP");
    assert_eq!(entries[1]["fd"], "STDIN");
    assert_eq!(entries[1]["json"]["method"], "x");
    assert_eq!(entries[2]["fd"], "EXIT");
}

#[tokio::test]
async fn records_after_close_are_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("traffic.jsonl");

    let log = TrafficLog::open("test", &path).await.expect("open");
    log.record(Direction::Stdout, "before").await;
    log.close().await;
    log.record(Direction::Stdout, "after").await;
    log.close().await;

    let entries = read_entries(&path);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["text"], "before");
}

#[tokio::test]
async fn disabled_log_writes_nothing() {
    let log = TrafficLog::disabled("quiet");
    log.record(Direction::Stdout, "ignored").await;
    log.flush().await;
    log.close().await;
    assert_eq!(log.label(), "quiet");
}

#[tokio::test]
async fn unopenable_path_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = TrafficLog::open("test", dir.path().join("missing/dir/log.jsonl"))
        .await
        .expect_err("parent missing");
    assert!(matches!(err, agent_conduit::AppError::Io(_)), "got {err:?}");
}
