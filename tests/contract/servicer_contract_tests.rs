//! Contract tests for the result shapes of client capability methods.

#![cfg(unix)]

use std::time::Duration;

use serde_json::{json, Value};

use agent_conduit::models::session::ClientCapabilities;
use agent_conduit::servicer::CapabilityServicer;

const STEP: Duration = Duration::from_secs(10);

// ─── fs ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_result_has_only_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "x").expect("seed");

    let result = CapabilityServicer::new(ClientCapabilities::default())
        .read_text_file(json!({ "path": path, "sessionId": "s" }))
        .await
        .expect("read");
    assert_eq!(result, json!({ "content": "x" }));
}

#[tokio::test]
async fn write_result_is_empty_object() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = CapabilityServicer::new(ClientCapabilities::default())
        .write_text_file(json!({ "path": dir.path().join("b.txt"), "content": "y", "sessionId": "s" }))
        .await
        .expect("write");
    assert_eq!(result, json!({}));
}

// ─── terminal ─────────────────────────────────────────────────────────

#[tokio::test]
async fn terminal_results_use_camel_case() {
    let servicer = CapabilityServicer::new(ClientCapabilities::default());
    let created = servicer
        .create_terminal(json!({
            "sessionId": "s",
            "command": "sh",
            "args": ["-c", "sleep 30"],
            "outputByteLimit": 1024,
        }))
        .await
        .expect("create");
    let id = created["terminalId"].as_str().expect("terminalId").to_owned();
    assert_eq!(created.as_object().map(serde_json::Map::len), Some(1));

    let running = servicer
        .terminal_output(json!({ "terminalId": id }))
        .await
        .expect("output");
    assert_eq!(running["exitStatus"], Value::Null);
    assert!(running["truncated"].is_boolean());

    assert_eq!(
        servicer
            .kill_terminal(json!({ "terminalId": id }))
            .await
            .expect("kill"),
        json!({})
    );
    let exit = tokio::time::timeout(STEP, servicer.wait_for_terminal_exit(json!({ "terminalId": id })))
        .await
        .expect("exit in time")
        .expect("wait");
    assert_eq!(exit, json!({ "exitCode": null, "signal": "SIGKILL" }));

    let done = servicer
        .terminal_output(json!({ "terminalId": id }))
        .await
        .expect("output");
    assert_eq!(done["exitStatus"], exit);

    assert_eq!(
        servicer
            .release_terminal(json!({ "terminalId": id }))
            .await
            .expect("release"),
        json!({})
    );
    assert_eq!(servicer.release_all().await, 0);
}
