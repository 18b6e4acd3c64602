//! Error taxonomy for the MCP client layer.

use std::sync::Arc;
use std::time::Duration;

use crate::transport::{TransportError, TransportKind};

/// Errors surfaced by [`McpClient`](crate::client::McpClient) and
/// [`ClientConnectionManager`](crate::manager::ClientConnectionManager).
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Empty or whitespace-only server name.
    #[error(transparent)]
    InvalidServerName(#[from] eb_domain::InvalidServerName),

    /// Operation on a name that was never registered.
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),

    /// Operation on a known server with no live connection.
    #[error("MCP server not connected: {0}")]
    NotConnected(String),

    /// A connection attempt failed (spawn failure, or both HTTP legs).
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Operation requires a specific transport kind.
    #[error("server {server} is connected via {actual}, but this operation requires the {required} transport")]
    WrongTransport {
        server: String,
        actual: TransportKind,
        required: TransportKind,
    },

    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level failure: JSON-RPC error response or a result payload
    /// that does not match the expected shape.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP request timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, McpError>;

/// The terminal outcome of one connection attempt.
///
/// Cloneable so that every caller awaiting the same de-duplicated connect
/// future receives the failure; the underlying (non-clonable) errors are
/// flattened into the message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to connect to MCP server {server}: {message}")]
pub struct ConnectError {
    pub server: String,
    pub message: String,
}

impl ConnectError {
    pub fn new(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            message: message.into(),
        }
    }
}

/// Shared form used as the error type of the de-duplicated connect future.
pub(crate) type SharedConnectError = Arc<ConnectError>;
