//! Shared types for the MCP streaming relay.
//!
//! This crate contains the JSON-RPC protocol model and the HTTP API payloads
//! used by the relay server and its integration tests.

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 8090;

pub mod api;
pub mod jsonrpc;

// Re-export commonly used types
pub use api::{Acceptance, ErrorResponse, HealthSnapshot};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
