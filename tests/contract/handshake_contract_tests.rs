//! Contract tests for the ACP handshake and session request shapes.

use serde_json::json;

use agent_conduit::acp::handshake::{
    cancel_params, initialize_params, parse_negotiated, prompt_params, set_mode_params,
    stop_reason, CLIENT_NAME, PROTOCOL_VERSION,
};
use agent_conduit::models::session::ClientCapabilities;

// ─── initialize ───────────────────────────────────────────────────────

#[test]
fn initialize_advertises_client_capabilities() {
    let params = initialize_params(ClientCapabilities {
        fs_read: true,
        fs_write: false,
        terminal: true,
    });

    assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(params["clientCapabilities"]["fs"]["readTextFile"], true);
    assert_eq!(params["clientCapabilities"]["fs"]["writeTextFile"], false);
    assert_eq!(params["clientCapabilities"]["terminal"], true);
    assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    assert!(params["clientInfo"]["version"].is_string());
}

#[test]
fn negotiated_result_is_parsed() {
    let negotiated = parse_negotiated(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "agentCapabilities": { "loadSession": true },
        "authMethods": [],
    }))
    .expect("valid result");
    assert!(negotiated.supports_load_session());
}

#[test]
fn non_object_result_is_rejected() {
    assert!(parse_negotiated(json!("ok")).is_err());
}

// ─── Session requests ─────────────────────────────────────────────────

#[test]
fn prompt_is_a_single_text_block() {
    assert_eq!(
        prompt_params("s1", "hi"),
        json!({
            "sessionId": "s1",
            "prompt": [{ "type": "text", "text": "hi" }],
        })
    );
}

#[test]
fn cancel_and_set_mode_carry_the_session() {
    assert_eq!(cancel_params("s1"), json!({ "sessionId": "s1" }));
    assert_eq!(
        set_mode_params("s1", "plan"),
        json!({ "sessionId": "s1", "modeId": "plan" })
    );
}

#[test]
fn stop_reason_defaults_to_end_turn() {
    assert_eq!(stop_reason(&json!({ "stopReason": "max_tokens" })), "max_tokens");
    assert_eq!(stop_reason(&json!(null)), "end_turn");
    assert_eq!(stop_reason(&json!({})), "end_turn");
}
