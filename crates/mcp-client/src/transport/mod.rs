//! MCP transport layer.
//!
//! Each MCP server speaks JSON-RPC over one of three byte-stream
//! mechanisms:
//! - **stdio**: spawn a child process, newline-delimited JSON over
//!   stdin/stdout.
//! - **sse**: legacy HTTP+SSE — a GET stream for inbound messages, a
//!   POST endpoint (announced on the stream) for outbound.
//! - **streamable-http**: modern bidirectional streaming — every outbound
//!   message is a POST whose response body is either a single JSON message
//!   or an SSE stream, plus an optional standalone GET listen stream.
//!
//! Transports only move framed messages. Request/response correlation,
//! timeouts, and dispatch live in [`crate::client::McpClient`]: a transport
//! is constructed with an unbounded sender and pushes every inbound
//! message into it; dropping the sender signals transport close.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{IncomingMessage, OutgoingMessage};

pub mod eventstream;
pub mod sse;
pub mod stdio;
pub mod streamable;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;

/// Channel into which a transport's read loop delivers inbound messages.
pub type IncomingTx = mpsc::UnboundedSender<IncomingMessage>;
pub type IncomingRx = mpsc::UnboundedReceiver<IncomingMessage>;

/// Which byte-stream mechanism a live connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error status: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("transport is closed")]
    Closed,

    #[error("transport protocol violation: {0}")]
    Protocol(String),
}

/// Trait for MCP server transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one framed JSON-RPC message.
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Which mechanism this transport uses.
    fn kind(&self) -> TransportKind;

    /// The streamable-HTTP session id, where the transport has one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Shut down the transport. Best-effort: never fails, logs problems.
    async fn close(&self);
}
