//! Unit tests for `SessionRouter`: session filtering, sub-agent routing and
//! tool-call merging.

use serde_json::{json, Value};

use agent_conduit::driver::TransportEvent;
use agent_conduit::models::tool_call::{ToolCallRecord, ToolCallStatus, ToolCallUpdate};
use agent_conduit::models::update::{SessionNotification, SessionUpdate};
use agent_conduit::router::{ConversationId, SessionRouter, SessionSignal};

fn record(raw: Value) -> ToolCallRecord {
    serde_json::from_value(raw).expect("tool call record")
}

fn update(raw: Value) -> ToolCallUpdate {
    serde_json::from_value(raw).expect("tool call update")
}

fn signal(session_id: &str, update: SessionUpdate) -> SessionSignal {
    SessionSignal::Update(SessionNotification {
        session_id: session_id.to_owned(),
        update,
    })
}

fn text_chunk(text: &str) -> SessionUpdate {
    SessionUpdate::AgentMessageChunk {
        content: json!({ "type": "text", "text": text }),
    }
}

fn spawn_task(router: &mut SessionRouter) -> ConversationId {
    let events = router.handle_tool_call(record(json!({
        "toolCallId": "task-1",
        "title": "Task",
        "status": "in_progress",
        "rawInput": { "subagent_type": "explorer", "prompt": "look around" },
    })));
    match events.as_slice() {
        [TransportEvent::ToolCall { conversation, .. }, TransportEvent::SubagentStarted {
            conversation: child,
            parent,
            tool_call_id,
            ..
        }] => {
            assert!(conversation.is_primary());
            assert!(parent.is_primary());
            assert_eq!(tool_call_id, "task-1");
            child.clone()
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

// ── Session filtering ────────────────────────────────────────────────────────

#[test]
fn signals_for_other_sessions_are_dropped() {
    let mut router = SessionRouter::new("sess-a");
    assert!(router.handle(signal("sess-b", text_chunk("nope"))).is_empty());

    let events = router.handle(signal("sess-a", text_chunk("yes")));
    assert_eq!(
        events,
        vec![TransportEvent::Text {
            conversation: ConversationId::primary(),
            text: "yes".into(),
        }]
    );
}

#[test]
fn alias_accepts_reassigned_session_id() {
    let mut router = SessionRouter::new("requested");
    router.add_alias("reassigned");
    assert_eq!(router.handle(signal("reassigned", text_chunk("hi"))).len(), 1);
}

#[test]
fn turn_signals_map_to_completion_and_error() {
    let mut router = SessionRouter::new("s");
    assert_eq!(
        router.handle(SessionSignal::TurnEnded {
            session_id: "s".into(),
            stop_reason: "end_turn".into(),
        }),
        vec![TransportEvent::TurnComplete {
            stop_reason: "end_turn".into()
        }]
    );
    assert_eq!(
        router.handle(SessionSignal::TurnFailed {
            session_id: "s".into(),
            message: "boom".into(),
        }),
        vec![TransportEvent::Error {
            message: "boom".into()
        }]
    );
}

// ── Update variants ──────────────────────────────────────────────────────────

#[test]
fn empty_chunks_produce_no_events() {
    let mut router = SessionRouter::new("s");
    assert!(router.handle_update(text_chunk("")).is_empty());
    assert!(router
        .handle_update(SessionUpdate::AgentThoughtChunk {
            content: json!({ "type": "image", "data": "…" }),
        })
        .is_empty());
}

#[test]
fn mode_update_is_remembered() {
    let mut router = SessionRouter::new("s");
    let events = router.handle_update(SessionUpdate::CurrentModeUpdate {
        current_mode_id: "plan".into(),
    });
    assert_eq!(
        events,
        vec![TransportEvent::ModeChanged {
            mode_id: "plan".into()
        }]
    );
    assert_eq!(router.current_mode(), Some("plan"));
}

#[test]
fn unknown_update_is_tolerated() {
    let mut router = SessionRouter::new("s");
    let events = router.handle_update(SessionUpdate::Unknown {
        kind: "from_the_future".into(),
        raw: json!({ "sessionUpdate": "from_the_future" }),
    });
    assert!(events.is_empty());
}

// ── Sub-agent routing ────────────────────────────────────────────────────────

/// A "Task" call with `subagent_type` opens exactly one conversation, and
/// every later update for it is delivered there.
#[test]
fn task_tool_call_routes_updates_to_new_conversation() {
    let mut router = SessionRouter::new("s");
    let child = spawn_task(&mut router);
    assert!(!child.is_primary());
    assert_eq!(router.route_count(), 1);

    for status in ["in_progress", "in_progress"] {
        let events = router.update_tool_call(&update(json!({
            "toolCallId": "task-1",
            "status": status,
            "content": [{ "type": "content", "content": { "type": "text", "text": "…" } }],
        })));
        match events.as_slice() {
            [TransportEvent::ToolCallUpdated { conversation, .. }] => {
                assert_eq!(conversation, &child);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
    assert_eq!(router.route_count(), 1, "no extra conversations");
}

/// Re-announcing a spawn does not open a second conversation.
#[test]
fn reannounced_spawn_keeps_one_route() {
    let mut router = SessionRouter::new("s");
    let child = spawn_task(&mut router);

    let events = router.handle_tool_call(record(json!({
        "toolCallId": "task-1",
        "title": "Task",
        "rawInput": { "subagent_type": "explorer" },
    })));
    assert_eq!(events.len(), 1, "no second SubagentStarted");
    assert_eq!(router.route_count(), 1);
    assert_eq!(router.conversation_for("task-1", None), child);
}

/// Calls naming a routed parent in `_meta` belong to the parent's
/// conversation.
#[test]
fn nested_call_follows_parent_route() {
    let mut router = SessionRouter::new("s");
    let child = spawn_task(&mut router);

    let events = router.handle_tool_call(record(json!({
        "toolCallId": "read-1",
        "title": "Read",
        "_meta": { "claudeCode": { "parentToolUseId": "task-1" } },
    })));
    match events.as_slice() {
        [TransportEvent::ToolCall { conversation, call }] => {
            assert_eq!(conversation, &child);
            assert!(!call.is_subagent_spawn);
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

/// A terminal status on the spawning call finishes the sub-agent once.
#[test]
fn terminal_status_finishes_subagent_once() {
    let mut router = SessionRouter::new("s");
    let child = spawn_task(&mut router);

    let events = router.update_tool_call(&update(json!({
        "toolCallId": "task-1",
        "status": "completed",
    })));
    assert!(events.iter().any(|e| matches!(
        e,
        TransportEvent::SubagentFinished { conversation, status: ToolCallStatus::Completed, .. }
            if conversation == &child
    )));

    let again = router.update_tool_call(&update(json!({
        "toolCallId": "task-1",
        "status": "completed",
    })));
    assert!(!again
        .iter()
        .any(|e| matches!(e, TransportEvent::SubagentFinished { .. })));
}

/// Classification can arrive late, through an update that supplies the
/// title.
#[test]
fn late_title_classifies_spawn() {
    let mut router = SessionRouter::new("s");
    router.handle_tool_call(record(json!({ "toolCallId": "x", "title": "" })));
    assert_eq!(router.route_count(), 0);

    let events = router.update_tool_call(&update(json!({
        "toolCallId": "x",
        "title": "Launch agent",
    })));
    assert!(matches!(
        events.first(),
        Some(TransportEvent::SubagentStarted { .. })
    ));
    assert_eq!(router.route_count(), 1);
}

/// The heuristic also fires on titles that merely mention "task".
#[test]
fn title_heuristic_is_substring_match() {
    let mut router = SessionRouter::new("s");
    let events = router.handle_tool_call(record(json!({
        "toolCallId": "todo",
        "title": "Update task list",
    })));
    assert_eq!(events.len(), 2);
    assert_eq!(router.route_count(), 1);
}

#[test]
fn plain_tool_call_stays_in_primary() {
    let mut router = SessionRouter::new("s");
    let events = router.handle_tool_call(record(json!({
        "toolCallId": "bash-1",
        "title": "Bash",
        "rawInput": { "command": "ls" },
    })));
    match events.as_slice() {
        [TransportEvent::ToolCall { conversation, .. }] => assert!(conversation.is_primary()),
        other => panic!("unexpected events: {other:?}"),
    }
    assert_eq!(router.route_count(), 0);
}

#[test]
fn unregister_and_reset_drop_routes() {
    let mut router = SessionRouter::new("s");
    let child = spawn_task(&mut router);
    assert_eq!(router.unregister_route("task-1"), Some(child));
    assert!(router.conversation_for("task-1", None).is_primary());

    router.reset();
    spawn_task(&mut router);
    assert_eq!(router.route_count(), 1);
    router.reset();
    assert_eq!(router.route_count(), 0);
    assert!(router.tool_call("task-1").is_none());
}

// ── Partial merge ────────────────────────────────────────────────────────────

/// A status-only update leaves `rawOutput` null and keeps `rawInput`.
#[test]
fn partial_update_never_erases_absent_fields() {
    let mut router = SessionRouter::new("s");
    router.handle_tool_call(record(json!({
        "toolCallId": "bash-1",
        "title": "Bash",
        "kind": "execute",
        "status": "pending",
        "rawInput": { "command": "ls" },
        "locations": [{ "path": "/tmp" }],
    })));

    router.update_tool_call(&update(json!({
        "toolCallId": "bash-1",
        "status": "completed",
    })));

    let merged = router.tool_call("bash-1").expect("record");
    assert_eq!(merged.status, ToolCallStatus::Completed);
    assert_eq!(merged.raw_output, None);
    assert_eq!(merged.raw_input, Some(json!({ "command": "ls" })));
    assert_eq!(merged.title, "Bash");
    assert_eq!(merged.kind.as_deref(), Some("execute"));
    assert_eq!(merged.locations.len(), 1);
}

/// An update for a never-announced id creates the record.
#[test]
fn update_for_unknown_id_creates_record() {
    let mut router = SessionRouter::new("s");
    let events = router.update_tool_call(&update(json!({
        "toolCallId": "ghost",
        "status": "in_progress",
        "title": "Grep",
    })));
    assert_eq!(events.len(), 1);
    let created = router.tool_call("ghost").expect("created");
    assert_eq!(created.status, ToolCallStatus::InProgress);
    assert_eq!(created.title, "Grep");
}
