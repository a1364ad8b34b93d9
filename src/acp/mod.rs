//! Agent Client Protocol (ACP) plumbing.
//!
//! This module manages bidirectional NDJSON communication with agent
//! processes:
//! - `spawner`: process launch, stderr drain, exit monitoring, terminate.
//! - `codec`: [`AnyDelimiterCodec`](tokio_util::codec::AnyDelimiterCodec)-based framing for NDJSON.
//! - `reader` / `writer`: the two channel tasks over the agent's stdio.
//! - `connection`: JSON-RPC request/response correlation and dispatch.
//! - `handshake`: `initialize` and session establishment.

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod reader;
pub mod spawner;
pub mod writer;
