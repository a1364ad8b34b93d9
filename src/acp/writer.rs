//! ACP writer task.
//!
//! The writer is the only owner of the agent's stdin. Outbound frames arrive
//! on a tokio [`mpsc`] channel and are written one at a time through
//! [`FramedWrite`] with [`JsonLineCodec`], so concurrent callers can never
//! interleave partial lines.

use futures_util::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::JsonLineCodec;
use crate::traffic::{Direction, TrafficLog};
use crate::{AppError, Result};

/// ACP writer task: serialises outbound frames and writes them to `stdin`.
///
/// The task exits cleanly when:
/// - `cancel` is triggered, or
/// - `msg_rx` is closed (all senders dropped).
///
/// On exit the sink is closed, which closes the agent's stdin.
///
/// # Errors
///
/// Returns [`AppError::Acp`]`("write failed: …")` if a write fails (e.g. the
/// agent process has exited).
pub async fn run_writer<W>(
    label: String,
    stdin: W,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
    traffic: TrafficLog,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = FramedWrite::new(stdin, JsonLineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(connection = %label, "acp writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(connection = %label, "acp writer: message channel closed, stopping");
                    break;
                };

                traffic.record(Direction::Stdin, &value.to_string()).await;

                sink.send(value).await.map_err(|e| {
                    warn!(connection = %label, error = %e, "acp writer: write to stdin failed");
                    AppError::Acp(format!("write failed: {e}"))
                })?;
            }
        }
    }

    if let Err(err) = sink.close().await {
        debug!(connection = %label, %err, "acp writer: closing stdin failed");
    }
    Ok(())
}
