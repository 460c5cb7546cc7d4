//! Shared types for the Buildspace MCP gateways: session ids, JSON-RPC wire
//! messages, protocol errors, the `Tool` trait and the learning-plan model.

pub mod errors;
pub mod ids;
pub mod plan;
pub mod rpc;
pub mod tools;
