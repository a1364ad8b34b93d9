#![forbid(unsafe_code)]

//! Agent session transport.
//!
//! Spawns a coding-agent process, speaks newline-delimited JSON-RPC 2.0
//! (the Agent Client Protocol) over its stdio, and presents the session to a
//! view layer as an ordered event sequence plus a command sink.

pub mod acp;
pub mod broker;
pub mod config;
pub mod driver;
pub mod errors;
pub mod models;
pub mod router;
pub mod servicer;
pub mod traffic;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
