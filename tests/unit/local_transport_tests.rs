//! Unit tests for the in-process transport.
//!
//! A scripted [`LocalAgent`] drives the same router and permission broker the
//! ACP transport uses, so these tests pin down the facade contract without a
//! child process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use agent_conduit::driver::local_driver::{LocalAgent, LocalContext, LocalTransport};
use agent_conduit::driver::{AgentTransport, TransportCommand, TransportEvent, TransportFuture};
use agent_conduit::models::permission::{PermissionOutcome, PermissionRequest};
use agent_conduit::models::session::TransportStatus;
use agent_conduit::models::update::SessionUpdate;
use agent_conduit::router::ConversationId;
use agent_conduit::{AppError, Result};

const STEP: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ScriptedAgent {
    cancelled: AtomicBool,
}

fn say(ctx: &LocalContext, text: &str) {
    ctx.update(SessionUpdate::AgentMessageChunk {
        content: json!({ "type": "text", "text": text }),
    });
}

impl LocalAgent for ScriptedAgent {
    fn prompt<'a>(
        &'a self,
        ctx: &'a LocalContext,
        text: String,
    ) -> TransportFuture<'a, Result<String>> {
        Box::pin(async move {
            match text.as_str() {
                "ask" => {
                    let request = PermissionRequest::from_params(&json!({
                        "sessionId": ctx.session_id(),
                        "toolCall": { "toolCallId": "call_1", "title": "Bash" },
                    }))?;
                    match ctx.request_permission(request).await {
                        PermissionOutcome::Allow { .. } => say(ctx, "allowed"),
                        PermissionOutcome::Deny { reason } => say(ctx, &format!("denied: {reason}")),
                        PermissionOutcome::Cancelled => return Ok("cancelled".into()),
                    }
                    Ok("end_turn".into())
                }
                "fail" => Err(AppError::Acp("boom".into())),
                other => {
                    say(ctx, other);
                    Ok("end_turn".into())
                }
            }
        })
    }

    fn cancel(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.cancelled.store(true, Ordering::SeqCst);
        })
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(STEP, events.recv())
        .await
        .expect("event in time")
        .expect("event sequence open")
}

async fn started() -> (
    LocalTransport,
    Arc<ScriptedAgent>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let agent = Arc::new(ScriptedAgent::default());
    let transport = LocalTransport::start(Arc::clone(&agent) as Arc<dyn LocalAgent>);
    let mut events = transport.take_events().await.expect("events");
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Status(TransportStatus::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Status(TransportStatus::Connected)
    );
    (transport, agent, events)
}

#[tokio::test]
async fn prompt_streams_text_then_turn_complete() {
    let (transport, _agent, mut events) = started().await;

    transport
        .send(TransportCommand::Prompt {
            text: "hello".into(),
        })
        .await
        .expect("prompt");

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Text {
            conversation: ConversationId::primary(),
            text: "hello".into(),
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::TurnComplete {
            stop_reason: "end_turn".into()
        }
    );
    assert_eq!(transport.session_id(), transport.resolved_session_id());
    assert_eq!(transport.capabilities().protocol_version, 1);
}

#[tokio::test]
async fn failed_turn_surfaces_error_event() {
    let (transport, _agent, mut events) = started().await;

    transport
        .send(TransportCommand::Prompt {
            text: "fail".into(),
        })
        .await
        .expect("prompt accepted");

    match next_event(&mut events).await {
        TransportEvent::Error { message } => assert!(message.contains("boom"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(*transport.status().borrow(), TransportStatus::Connected);
}

#[tokio::test]
async fn permission_round_trip_through_broker() {
    let (transport, _agent, mut events) = started().await;
    let mut requests = transport.take_permission_requests().await.expect("requests");

    transport
        .send(TransportCommand::Prompt { text: "ask".into() })
        .await
        .expect("prompt");

    let request = tokio::time::timeout(STEP, requests.recv())
        .await
        .expect("request in time")
        .expect("request");
    assert_eq!(request.tool_name, "Bash");
    assert!(transport.permissions().is_pending(&request.id).await);

    transport
        .permissions()
        .deny(&request.id, "not today")
        .await
        .expect("deny");

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Text {
            conversation: ConversationId::primary(),
            text: "denied: not today".into(),
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::TurnComplete { .. }
    ));
    assert!(!transport.permissions().is_pending(&request.id).await);
}

#[tokio::test]
async fn cancel_reaches_agent_and_withdraws_permissions() {
    let (transport, agent, mut events) = started().await;
    let mut requests = transport.take_permission_requests().await.expect("requests");

    transport
        .send(TransportCommand::Prompt { text: "ask".into() })
        .await
        .expect("prompt");
    let request = tokio::time::timeout(STEP, requests.recv())
        .await
        .expect("request in time")
        .expect("request");

    transport.send(TransportCommand::Cancel).await.expect("cancel");
    assert!(agent.cancelled.load(Ordering::SeqCst));

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::TurnComplete {
            stop_reason: "cancelled".into()
        }
    );
    let err = transport
        .permissions()
        .allow(&request.id, None)
        .await
        .expect_err("already cancelled");
    assert!(matches!(err, AppError::AlreadyConsumed(_)), "got {err:?}");
}

#[tokio::test]
async fn set_mode_updates_current_mode() {
    let (transport, _agent, _events) = started().await;
    assert_eq!(transport.current_mode(), None);

    transport
        .send(TransportCommand::SetMode {
            mode_id: "plan".into(),
        })
        .await
        .expect("set mode");
    assert_eq!(transport.current_mode().as_deref(), Some("plan"));
}

#[tokio::test]
async fn empty_prompt_is_invalid_params() {
    let (transport, _agent, _events) = started().await;
    let err = transport
        .send(TransportCommand::Prompt { text: "  ".into() })
        .await
        .expect_err("empty");
    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");
}

#[tokio::test]
async fn sequences_can_be_taken_once() {
    let (transport, _agent, _events) = started().await;
    assert!(matches!(
        transport.take_events().await,
        Err(AppError::AlreadyConsumed(_))
    ));
    transport.take_permission_requests().await.expect("first");
    assert!(matches!(
        transport.take_permission_requests().await,
        Err(AppError::AlreadyConsumed(_))
    ));
}

#[tokio::test]
async fn dispose_is_idempotent_and_closes_commands() {
    let (transport, _agent, mut events) = started().await;

    transport.dispose().await;
    transport.dispose().await;

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Status(TransportStatus::Disconnected)
    );
    assert_eq!(*transport.status().borrow(), TransportStatus::Disconnected);

    let err = transport
        .send(TransportCommand::Prompt { text: "hi".into() })
        .await
        .expect_err("disposed");
    assert!(err.is_connection_closed(), "got {err:?}");
}
