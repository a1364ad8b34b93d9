//! ACP reader task.
//!
//! Reads newline-delimited JSON frames from an agent's stdout, classifies each
//! into an [`RpcMessage`], and forwards the result through a tokio [`mpsc`]
//! channel to the connection's dispatcher.
//!
//! The reader is driven by [`FramedRead`] backed by [`JsonLineCodec`], which
//! enforces the 1 MiB per-line limit before any JSON parsing happens.
//! Malformed lines are reported as [`Inbound::Malformed`] and skipped; they
//! never end the stream. The stream ends with exactly one
//! [`Inbound::Closed`] unless the reader is cancelled.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::{Frame, JsonLineCodec};
use crate::models::rpc::RpcMessage;
use crate::traffic::{Direction, TrafficLog};
use crate::{AppError, Result};

/// Item produced by the reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed JSON-RPC frame.
    Message(RpcMessage),
    /// A line that failed to decode; the channel continues.
    Malformed {
        /// The offending line.
        raw: String,
        /// Failure description.
        error: String,
    },
    /// The stream ended (EOF or unrecoverable I/O error).
    Closed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Parse a single NDJSON line into an [`RpcMessage`].
///
/// # Return value
///
/// - `Ok(Some(message))`: the line is a well-formed JSON-RPC frame.
/// - `Ok(None)`: the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::Decode`]: not valid JSON.
/// - [`AppError::Protocol`]: valid JSON but not a JSON-RPC envelope.
pub fn parse_inbound_line(line: &str) -> Result<Option<RpcMessage>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(line)
        .map_err(|e| AppError::Decode(format!("malformed json: {e}")))?;
    RpcMessage::from_value(value).map(Some)
}

/// ACP reader task: reads frames from `stdout` and emits [`Inbound`] items.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits without emitting
/// [`Inbound::Closed`].
pub async fn run_reader<R>(
    label: String,
    stdout: R,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    traffic: TrafficLog,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, JsonLineCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(connection = %label, "acp reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                let inbound = match item {
                    None => {
                        debug!(connection = %label, "acp reader: EOF detected");
                        break "stream closed".to_owned();
                    }
                    Some(Err(e)) => {
                        warn!(connection = %label, error = %e, "acp reader: IO error, stopping");
                        break format!("stream error: {e}");
                    }
                    Some(Ok(Frame::Malformed { raw, error })) => {
                        traffic.record(Direction::Stdout, &raw).await;
                        Inbound::Malformed { raw, error }
                    }
                    Some(Ok(Frame::Value { value, raw })) => {
                        traffic.record(Direction::Stdout, &raw).await;
                        match RpcMessage::from_value(value) {
                            Ok(message) => Inbound::Message(message),
                            Err(e) => Inbound::Malformed { raw, error: e.to_string() },
                        }
                    }
                };

                if inbound_tx.send(inbound).await.is_err() {
                    debug!(connection = %label, "acp reader: inbound channel closed, stopping");
                    return;
                }
            }
        }
    };

    if inbound_tx.send(Inbound::Closed { reason }).await.is_err() {
        debug!(
            connection = %label,
            "acp reader: inbound channel closed before Closed could be delivered"
        );
    }
}
