//! Unit tests for transport status transitions and negotiated capabilities.

use serde_json::json;

use agent_conduit::models::session::{NegotiatedCapabilities, TransportStatus};

#[test]
fn status_moves_forward_only() {
    use TransportStatus::{Connected, Connecting, Disconnected, Error};

    assert!(Connecting.can_transition_to(Connected));
    assert!(Connecting.can_transition_to(Error));
    assert!(Connected.can_transition_to(Disconnected));
    assert!(Connected.can_transition_to(Error));
    assert!(Error.can_transition_to(Connecting));

    assert!(!Connected.can_transition_to(Connecting));
    assert!(!Disconnected.can_transition_to(Connected));
    assert!(!Disconnected.can_transition_to(Error));
    assert!(!Error.can_transition_to(Disconnected));
    assert!(!Connected.can_transition_to(Connected));
}

#[test]
fn terminal_statuses() {
    assert!(TransportStatus::Disconnected.is_terminal());
    assert!(TransportStatus::Error.is_terminal());
    assert!(!TransportStatus::Connected.is_terminal());
}

#[test]
fn status_display_is_lowercase() {
    assert_eq!(TransportStatus::Connecting.to_string(), "connecting");
    assert_eq!(TransportStatus::Error.to_string(), "error");
}

#[test]
fn load_session_support_is_read_from_agent_capabilities() {
    let caps: NegotiatedCapabilities = serde_json::from_value(json!({
        "protocolVersion": 1,
        "agentCapabilities": { "loadSession": true },
        "authMethods": [{ "id": "oauth", "name": "OAuth" }],
    }))
    .expect("decode");
    assert!(caps.supports_load_session());
    assert_eq!(caps.auth_methods[0].id, "oauth");

    assert!(!NegotiatedCapabilities::default().supports_load_session());
}
