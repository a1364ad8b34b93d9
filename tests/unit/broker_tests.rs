//! Unit tests for `PermissionBroker`.

use chrono::Utc;
use serde_json::{json, Value};

use agent_conduit::broker::{PermissionBroker, RESOLVED_HISTORY};
use agent_conduit::models::permission::{PermissionOutcome, PermissionRequest};
use agent_conduit::AppError;

fn request(id: &str, tool: &str) -> PermissionRequest {
    PermissionRequest {
        id: id.to_owned(),
        session_id: "sess-1".to_owned(),
        tool_call_id: format!("call-{id}"),
        tool_name: tool.to_owned(),
        tool_input: json!({ "command": "ls" }),
        options: Vec::new(),
        created_at: Utc::now(),
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// A request is accepted exactly once; the second resolve is an error and
/// the requester only ever sees the first outcome.
#[tokio::test]
async fn second_resolve_is_rejected() {
    let broker = PermissionBroker::new();
    let rx = broker.submit(request("p1", "Bash")).await;

    broker
        .deny("p1", "not allowed")
        .await
        .expect("first resolve");
    let err = broker
        .allow("p1", None)
        .await
        .expect_err("second resolve must fail");
    assert!(matches!(err, AppError::AlreadyConsumed(_)), "got {err:?}");

    assert_eq!(
        rx.await.expect("outcome"),
        PermissionOutcome::Deny {
            reason: "not allowed".into()
        }
    );
}

#[tokio::test]
async fn resolving_unknown_id_is_not_found() {
    let broker = PermissionBroker::new();
    let err = broker.cancel("never-submitted").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

/// Only the most recent resolved ids are remembered; the oldest fall back
/// to `NotFound` once the history is full.
#[tokio::test]
async fn resolved_history_is_bounded() {
    let broker = PermissionBroker::new();
    for n in 0..=RESOLVED_HISTORY {
        let id = format!("p{n}");
        let _rx = broker.submit(request(&id, "Bash")).await;
        broker.cancel(&id).await.expect("resolve");
    }

    let oldest = broker.cancel("p0").await.expect_err("forgotten");
    assert!(matches!(oldest, AppError::NotFound(_)), "got {oldest:?}");

    let newest = broker
        .cancel(&format!("p{RESOLVED_HISTORY}"))
        .await
        .expect_err("remembered");
    assert!(matches!(newest, AppError::AlreadyConsumed(_)), "got {newest:?}");
}

/// Allow carries the edited input through to the requester.
#[tokio::test]
async fn allow_carries_updated_input() {
    let broker = PermissionBroker::new();
    let rx = broker.submit(request("p1", "Edit")).await;
    let edited = json!({ "command": "ls -la" });

    broker
        .allow("p1", Some(edited.clone()))
        .await
        .expect("allow");
    assert_eq!(
        rx.await.expect("outcome"),
        PermissionOutcome::Allow {
            updated_input: Some(edited)
        }
    );
}

/// Resolution removes the request from the pending set.
#[tokio::test]
async fn resolved_request_leaves_pending_set() {
    let broker = PermissionBroker::new();
    let _rx = broker.submit(request("p1", "Bash")).await;
    assert!(broker.is_pending("p1").await);

    broker.deny("p1", "no").await.expect("deny");
    assert!(!broker.is_pending("p1").await);
    assert!(broker.pending().await.is_empty());
}

// ── Sequences ────────────────────────────────────────────────────────────────

/// Requests are published on the sequence in arrival order, and the
/// sequence can only be taken once.
#[tokio::test]
async fn requests_are_published_in_arrival_order() {
    let broker = PermissionBroker::new();
    let mut requests = broker.take_requests().await.expect("first take");
    assert!(matches!(
        broker.take_requests().await,
        Err(AppError::AlreadyConsumed(_))
    ));

    let _a = broker.submit(request("a", "Bash")).await;
    let _b = broker.submit(request("b", "Edit")).await;

    assert_eq!(requests.recv().await.expect("a").id, "a");
    assert_eq!(requests.recv().await.expect("b").id, "b");

    let pending: Vec<String> = broker.pending().await.into_iter().map(|r| r.id).collect();
    assert_eq!(pending, vec!["a".to_owned(), "b".to_owned()]);
}

/// Independent requests resolve independently.
#[tokio::test]
async fn concurrent_requests_are_independent() {
    let broker = PermissionBroker::new();
    let a = broker.submit(request("a", "Bash")).await;
    let b = broker.submit(request("b", "Bash")).await;

    broker.allow("b", None).await.expect("allow b");
    assert_eq!(
        b.await.expect("b"),
        PermissionOutcome::Allow {
            updated_input: None
        }
    );
    assert!(broker.is_pending("a").await);

    broker.cancel("a").await.expect("cancel a");
    assert_eq!(a.await.expect("a"), PermissionOutcome::Cancelled);
}

// ── Teardown ─────────────────────────────────────────────────────────────────

/// `cancel_all` force-resolves every outstanding request as cancelled and
/// later resolves report them as already consumed.
#[tokio::test]
async fn cancel_all_resolves_everything_as_cancelled() {
    let broker = PermissionBroker::new();
    let a = broker.submit(request("a", "Bash")).await;
    let b = broker.submit(request("b", "Write")).await;

    assert_eq!(broker.cancel_all("connection closed").await, 2);
    assert_eq!(a.await.expect("a"), PermissionOutcome::Cancelled);
    assert_eq!(b.await.expect("b"), PermissionOutcome::Cancelled);

    assert!(matches!(
        broker.allow("a", None::<Value>).await,
        Err(AppError::AlreadyConsumed(_))
    ));
    assert_eq!(broker.cancel_all("again").await, 0);
}
