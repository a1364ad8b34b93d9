//! Domain model module declarations.

pub mod permission;
pub mod rpc;
pub mod session;
pub mod tool_call;
pub mod update;
