//! `eb-mcp-client` — MCP (Model Context Protocol) client layer for EvalBench.
//!
//! This crate provides:
//! - JSON-RPC 2.0 framing and MCP payload types.
//! - Three transports: stdio (child processes), legacy HTTP+SSE, and
//!   modern streamable HTTP, behind one object-safe [`Transport`] trait.
//! - [`McpClient`]: a per-server protocol client with request/response
//!   correlation, timeouts, and server-initiated request handling
//!   (elicitation, ping).
//! - [`ClientConnectionManager`]: the registry of named server
//!   connections, multiplexing the uniform operation surface (tools,
//!   resources, prompts) with connect de-duplication and graceful
//!   teardown.
//!
//! # Usage
//!
//! ```rust,ignore
//! use eb_mcp_client::{ClientConnectionManager, ManagerOptions, McpConfig};
//!
//! let config: McpConfig = serde_json::from_str(raw)?;
//! let manager = ClientConnectionManager::new(config, ManagerOptions::default());
//!
//! // Flattened tool list across every connected server.
//! for (server, tool) in manager.get_tools(None).await? {
//!     println!("mcp:{server}:{}", tool.name);
//! }
//!
//! // Call a tool on one server.
//! let result = manager
//!     .execute_tool("filesystem", "read_file", serde_json::json!({"path": "/tmp/t"}), None)
//!     .await?;
//! ```

pub mod client;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience.
pub use client::{ElicitationResponder, McpClient, NotificationSink};
pub use error::{ConnectError, McpError, Result};
pub use manager::{ClientConnectionManager, ElicitationHandler, NotificationHandler};
pub use transport::{Transport, TransportError, TransportKind};

pub use eb_domain::{
    HttpServerConfig, ManagerOptions, McpConfig, ServerConfig, ServerName, StdioServerConfig,
};
