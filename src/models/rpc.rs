//! JSON-RPC 2.0 envelope model shared by both directions of the channel.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Protocol version tag carried on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and ACP-specific JSON-RPC error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// ACP: referenced resource (file, terminal) does not exist.
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
}

/// Request correlation id. Outbound ids are always numeric; inbound ids are
/// echoed back verbatim whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    Text(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code (see [`codes`]).
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with no `data` payload.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32600` for a frame that is not a valid request object.
    #[must_use]
    pub fn invalid_request(detail: &str) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("invalid request: {detail}"))
    }

    /// `-32601` for an inbound method nobody registered.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }
}

impl From<&AppError> for RpcError {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::NotFound(_) | AppError::TerminalNotFound(_) => codes::RESOURCE_NOT_FOUND,
            AppError::InvalidParams(_) => codes::INVALID_PARAMS,
            AppError::Rpc { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// A call expecting exactly one response.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Method parameters (`null` when absent).
        params: Value,
    },
    /// The answer to an earlier request.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Fire-and-forget message.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters (`null` when absent).
        params: Value,
    },
}

impl RpcMessage {
    /// Outbound request with a numeric id.
    #[must_use]
    pub fn request(id: i64, method: &str, params: Value) -> Self {
        Self::Request {
            id: RequestId::Number(id),
            method: method.to_owned(),
            params,
        }
    }

    /// Outbound notification.
    #[must_use]
    pub fn notification(method: &str, params: Value) -> Self {
        Self::Notification {
            method: method.to_owned(),
            params,
        }
    }

    /// Classify a decoded JSON value.
    ///
    /// A frame with `method` and a non-null `id` is a request, one with
    /// `method` and no id a notification, and one with `id` plus `result` or
    /// `error` a response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the value is not an object or fits
    /// none of the three shapes.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(AppError::Protocol("frame is not a json object".into()));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|e| {
                AppError::Protocol(format!("invalid request id: {e}"))
            })?),
        };

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(AppError::Protocol("`method` must be a string".into()));
            };
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(AppError::Protocol(
                "frame has neither `method` nor `id`".into(),
            ));
        };

        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error)
                .map_err(|e| AppError::Protocol(format!("invalid error object: {e}")))?;
            return Ok(Self::Response {
                id,
                outcome: Err(error),
            });
        }

        match obj.remove("result") {
            Some(result) => Ok(Self::Response {
                id,
                outcome: Ok(result),
            }),
            None => Err(AppError::Protocol(format!(
                "response {id} carries neither `result` nor `error`"
            ))),
        }
    }

    /// Serialise to the wire shape, including the `jsonrpc` tag.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), json!(id));
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(result) => obj.insert("result".into(), result.clone()),
                    Err(error) => obj.insert("error".into(), json!(error)),
                };
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Recover the id of an undecodable line that looks like a request, so
    /// the peer can be told it was rejected.
    ///
    /// Returns `None` for text that is not a JSON object, for frames without
    /// a usable id, and for response-shaped frames (`result` or `error`
    /// present), which are never answered.
    #[must_use]
    pub fn recover_request_id(raw: &str) -> Option<RequestId> {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) else {
            return None;
        };
        if obj.contains_key("result") || obj.contains_key("error") {
            return None;
        }
        obj.get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}
