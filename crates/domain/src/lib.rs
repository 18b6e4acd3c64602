//! Shared domain types for the EvalBench MCP layer.
//!
//! These are lightweight, serde-friendly types used to describe MCP server
//! connections. The actual client logic lives in the `eb-mcp-client` crate;
//! keeping the config model here lets other layers deserialize connection
//! settings without pulling in the full client stack.

pub mod config;
pub mod server_name;

pub use config::{
    HttpServerConfig, ManagerOptions, McpConfig, ReconnectPolicy, ServerConfig, StdioServerConfig,
};
pub use server_name::{InvalidServerName, ServerName};
