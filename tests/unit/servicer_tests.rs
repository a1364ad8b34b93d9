//! Unit tests for the `fs/*` and `terminal/*` request handlers.

use std::time::Duration;

use serde_json::json;

use agent_conduit::models::session::ClientCapabilities;
use agent_conduit::servicer::CapabilityServicer;
use agent_conduit::AppError;

fn servicer() -> CapabilityServicer {
    CapabilityServicer::new(ClientCapabilities::default())
}

// ── Files ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_then_read_round_trips_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested/dir/notes.txt");
    let servicer = servicer();

    let written = servicer
        .write_text_file(json!({ "path": path, "content": "one\ntwo\nthree\n" }))
        .await
        .expect("write");
    assert_eq!(written, json!({}));
    assert!(path.exists(), "parent directories are created");

    let read = servicer
        .read_text_file(json!({ "path": path }))
        .await
        .expect("read");
    assert_eq!(read, json!({ "content": "one\ntwo\nthree\n" }));
}

#[tokio::test]
async fn read_honours_line_and_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("lines.txt");
    std::fs::write(&path, "a\nb\nc\nd\n").expect("seed");

    let read = servicer()
        .read_text_file(json!({ "path": path, "line": 2, "limit": 2 }))
        .await
        .expect("read");
    assert_eq!(read["content"], "b\nc\n");
}

#[tokio::test]
async fn relative_paths_are_invalid_params() {
    let servicer = servicer();
    let err = servicer
        .read_text_file(json!({ "path": "relative.txt" }))
        .await
        .expect_err("relative read");
    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");

    let err = servicer
        .write_text_file(json!({ "path": "relative.txt", "content": "" }))
        .await
        .expect_err("relative write");
    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = servicer()
        .read_text_file(json!({ "path": dir.path().join("absent.txt") }))
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn malformed_params_are_invalid_params() {
    let err = servicer()
        .read_text_file(json!({ "file": "/tmp/x" }))
        .await
        .expect_err("no path");
    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");
}

// ── Terminals ────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn terminal_create_wait_and_output() {
    let servicer = servicer();
    let created = servicer
        .create_terminal(json!({
            "command": "sh",
            "args": ["-c", "echo \"$GREETING\"; exit 2"],
            "env": [{ "name": "GREETING", "value": "hi there" }],
        }))
        .await
        .expect("create");
    let terminal_id = created["terminalId"].as_str().expect("id").to_owned();

    let exit = tokio::time::timeout(
        Duration::from_secs(10),
        servicer.wait_for_terminal_exit(json!({ "terminalId": terminal_id })),
    )
    .await
    .expect("exit in time")
    .expect("wait");
    assert_eq!(exit, json!({ "exitCode": 2, "signal": null }));

    let output = servicer
        .terminal_output(json!({ "terminalId": terminal_id }))
        .await
        .expect("output");
    assert_eq!(output["output"], "hi there\n");
    assert_eq!(output["truncated"], false);
    assert_eq!(output["exitStatus"]["exitCode"], 2);

    servicer
        .release_terminal(json!({ "terminalId": terminal_id }))
        .await
        .expect("release");
    let err = servicer
        .terminal_output(json!({ "terminalId": terminal_id }))
        .await
        .expect_err("released");
    assert!(matches!(err, AppError::TerminalNotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn terminal_with_relative_cwd_is_rejected() {
    let err = servicer()
        .create_terminal(json!({ "command": "true", "cwd": "work" }))
        .await
        .expect_err("relative cwd");
    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_terminal_is_not_found() {
    let err = servicer()
        .kill_terminal(json!({ "terminalId": "term_missing" }))
        .await
        .expect_err("unknown");
    assert!(matches!(err, AppError::TerminalNotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn unstartable_terminal_is_spawn_error() {
    let err = servicer()
        .create_terminal(json!({ "command": "/definitely/not/a/binary" }))
        .await
        .expect_err("spawn");
    assert!(matches!(err, AppError::Spawn(_)), "got {err:?}");
}
