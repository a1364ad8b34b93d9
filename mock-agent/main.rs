#![forbid(unsafe_code)]

//! `mock-acp-agent`: scripted ACP agent for end-to-end transport tests.
//!
//! Speaks newline-delimited JSON-RPC on stdio. Every prompt is a script
//! keyword:
//!
//! | prompt         | behaviour                                                   |
//! |----------------|-------------------------------------------------------------|
//! | `hi`           | one `hello` chunk, `end_turn`                               |
//! | `bash`         | `Bash` tool call, asks permission, completes or fails        |
//! | `task`         | `Task` sub-agent with one nested tool call                  |
//! | `plan`         | a two-entry plan and a thought chunk                        |
//! | `hang`         | no answer until `session/cancel`, then `cancelled`          |
//! | `garbage`      | a non-JSON stdout line, then a `still here` chunk           |
//! | `crash`        | exits with code 3 without answering                         |
//! | `probe`        | sends the client an unknown method and reports the error    |
//! | `read <path>`  | `fs/read_text_file` round trip; echoes the content          |
//! | anything else  | `echo: <prompt>` chunk                                      |
//!
//! Set `MOCK_AGENT_NO_LOAD=1` to stop advertising `loadSession`.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

const SESSION_ID: &str = "mock-session-1";
const PERMISSION_CALL: i64 = 900;
const PROBE_CALL: i64 = 901;
const READ_CALL: i64 = 902;

/// A prompt waiting on something from the client.
enum Waiting {
    Cancel { prompt: Value },
    Permission { prompt: Value },
    Probe { prompt: Value },
    Read { prompt: Value },
}

struct Agent<W: Write> {
    out: W,
    waiting: Option<Waiting>,
}

fn main() {
    eprintln!("mock-acp-agent ready");
    let stdin = std::io::stdin();
    let mut agent = Agent {
        out: std::io::stdout().lock(),
        waiting: None,
    };

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-acp-agent: unparseable input: {line}");
            continue;
        };
        if agent.handle(&message).is_err() {
            break;
        }
    }
}

impl<W: Write> Agent<W> {
    fn send(&mut self, message: &Value) -> std::io::Result<()> {
        writeln!(self.out, "{message}")?;
        self.out.flush()
    }

    fn respond(&mut self, id: &Value, result: Value) -> std::io::Result<()> {
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    fn update(&mut self, update: Value) -> std::io::Result<()> {
        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": SESSION_ID, "update": update },
        }))
    }

    fn chunk(&mut self, text: &str) -> std::io::Result<()> {
        self.update(json!({
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "text", "text": text },
        }))
    }

    fn end_turn(&mut self, prompt: &Value, stop_reason: &str) -> std::io::Result<()> {
        self.respond(prompt, json!({ "stopReason": stop_reason }))
    }

    fn handle(&mut self, message: &Value) -> std::io::Result<()> {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (method, id) {
            (Some(method), Some(id)) => self.on_request(method, &id, &params),
            (Some(method), None) => self.on_notification(method),
            (None, Some(id)) => self.on_response(&id, message),
            (None, None) => Ok(()),
        }
    }

    fn on_request(&mut self, method: &str, id: &Value, params: &Value) -> std::io::Result<()> {
        match method {
            "initialize" => {
                let load = std::env::var("MOCK_AGENT_NO_LOAD").map_or(true, |v| v != "1");
                self.respond(
                    id,
                    json!({
                        "protocolVersion": 1,
                        "agentCapabilities": { "loadSession": load },
                        "authMethods": [],
                    }),
                )
            }
            "session/new" => self.respond(
                id,
                json!({
                    "sessionId": SESSION_ID,
                    "modes": {
                        "currentModeId": "default",
                        "availableModes": [
                            { "id": "default", "name": "Default" },
                            { "id": "plan", "name": "Plan" },
                        ],
                    },
                }),
            ),
            "session/load" => {
                self.update(json!({
                    "sessionUpdate": "user_message_chunk",
                    "content": { "type": "text", "text": "earlier question" },
                }))?;
                self.chunk("earlier answer")?;
                self.respond(id, Value::Null)
            }
            "session/set_mode" => {
                let mode = params.get("modeId").cloned().unwrap_or(Value::Null);
                self.update(json!({ "sessionUpdate": "current_mode_update", "currentModeId": mode }))?;
                self.respond(id, Value::Null)
            }
            "session/prompt" => self.on_prompt(id, params),
            _ => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {method}") },
            })),
        }
    }

    fn on_prompt(&mut self, id: &Value, params: &Value) -> std::io::Result<()> {
        let text = params
            .pointer("/prompt/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_owned();
        let prompt = id.clone();

        match text.as_str() {
            "hi" => {
                self.chunk("hello")?;
                self.end_turn(&prompt, "end_turn")
            }
            "bash" => {
                self.update(json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": "call_bash",
                    "title": "Bash",
                    "kind": "execute",
                    "status": "pending",
                    "rawInput": { "command": "ls" },
                }))?;
                self.waiting = Some(Waiting::Permission { prompt });
                self.send(&json!({
                    "jsonrpc": "2.0",
                    "id": PERMISSION_CALL,
                    "method": "session/request_permission",
                    "params": {
                        "sessionId": SESSION_ID,
                        "toolCall": {
                            "toolCallId": "call_bash",
                            "title": "Bash",
                            "rawInput": { "command": "ls" },
                        },
                        "options": [
                            { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                            { "optionId": "reject", "name": "Reject", "kind": "reject_once" },
                        ],
                    },
                }))
            }
            "task" => {
                self.update(json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": "task_1",
                    "title": "Task",
                    "status": "in_progress",
                    "rawInput": { "subagent_type": "explorer", "description": "look around" },
                }))?;
                self.update(json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": "child_1",
                    "title": "Read",
                    "kind": "read",
                    "status": "in_progress",
                    "_meta": { "claudeCode": { "parentToolUseId": "task_1" } },
                }))?;
                self.update(json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": "child_1",
                    "status": "completed",
                }))?;
                self.update(json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": "task_1",
                    "status": "completed",
                }))?;
                self.end_turn(&prompt, "end_turn")
            }
            "plan" => {
                self.update(json!({
                    "sessionUpdate": "agent_thought_chunk",
                    "content": { "type": "text", "text": "thinking it over" },
                }))?;
                self.update(json!({
                    "sessionUpdate": "plan",
                    "entries": [
                        { "content": "read code", "priority": "high", "status": "completed" },
                        { "content": "write code", "priority": "medium", "status": "pending" },
                    ],
                }))?;
                self.end_turn(&prompt, "end_turn")
            }
            "hang" => {
                self.waiting = Some(Waiting::Cancel { prompt });
                Ok(())
            }
            "garbage" => {
                writeln!(self.out, "this line is not json")?;
                self.chunk("still here")?;
                self.end_turn(&prompt, "end_turn")
            }
            "crash" => std::process::exit(3),
            "probe" => {
                self.waiting = Some(Waiting::Probe { prompt });
                self.send(&json!({
                    "jsonrpc": "2.0",
                    "id": PROBE_CALL,
                    "method": "client/not_a_method",
                    "params": {},
                }))
            }
            other => {
                if let Some(path) = other.strip_prefix("read ") {
                    self.waiting = Some(Waiting::Read { prompt });
                    return self.send(&json!({
                        "jsonrpc": "2.0",
                        "id": READ_CALL,
                        "method": "fs/read_text_file",
                        "params": { "sessionId": SESSION_ID, "path": path },
                    }));
                }
                self.chunk(&format!("echo: {other}"))?;
                self.end_turn(&prompt, "end_turn")
            }
        }
    }

    fn on_notification(&mut self, method: &str) -> std::io::Result<()> {
        if method != "session/cancel" {
            return Ok(());
        }
        match self.waiting.take() {
            Some(Waiting::Cancel { prompt } | Waiting::Permission { prompt }) => {
                self.end_turn(&prompt, "cancelled")
            }
            other => {
                self.waiting = other;
                Ok(())
            }
        }
    }

    fn on_response(&mut self, id: &Value, message: &Value) -> std::io::Result<()> {
        let id = id.as_i64();
        match (self.waiting.take(), id) {
            (Some(Waiting::Permission { prompt }), Some(PERMISSION_CALL)) => {
                let outcome = message.pointer("/result/outcome");
                let cancelled = outcome
                    .and_then(|o| o.get("outcome"))
                    .and_then(Value::as_str)
                    == Some("cancelled");
                if cancelled {
                    return self.end_turn(&prompt, "cancelled");
                }
                let allowed = outcome
                    .and_then(|o| o.get("optionId"))
                    .and_then(Value::as_str)
                    == Some("allow");
                let status = if allowed { "completed" } else { "failed" };
                self.update(json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": "call_bash",
                    "status": status,
                }))?;
                self.end_turn(&prompt, "end_turn")
            }
            (Some(Waiting::Probe { prompt }), Some(PROBE_CALL)) => {
                let code = message
                    .pointer("/error/code")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                self.chunk(&format!("probe: {code}"))?;
                self.end_turn(&prompt, "end_turn")
            }
            (Some(Waiting::Read { prompt }), Some(READ_CALL)) => {
                let text = message
                    .pointer("/result/content")
                    .and_then(Value::as_str)
                    .map_or_else(
                        || {
                            let err = message
                                .pointer("/error/message")
                                .and_then(Value::as_str)
                                .unwrap_or("no content");
                            format!("read failed: {err}")
                        },
                        ToOwned::to_owned,
                    );
                self.chunk(&text)?;
                self.end_turn(&prompt, "end_turn")
            }
            (other, _) => {
                self.waiting = other;
                Ok(())
            }
        }
    }
}
