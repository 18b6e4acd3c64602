//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use eb_domain::StdioServerConfig;

use super::{IncomingTx, Transport, TransportError, TransportKind};
use crate::protocol::{IncomingMessage, OutgoingMessage};

/// Maximum number of non-JSON lines to skip before declaring the server
/// broken (a misconfigured server logging to stdout).
const MAX_SKIP_LINES: usize = 1000;

/// How long to wait for the child to exit after stdin closes before killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line. The reader
/// task pushes every inbound line into the client's incoming channel and
/// drops the sender on EOF, which is how process death becomes a close
/// signal upstream.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Spawn the configured command. The child inherits the current process
    /// environment, with config-supplied variables merged over it.
    pub fn spawn(config: &StdioServerConfig, incoming: IncomingTx) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stderr",
            ))
        })?;

        let alive = Arc::new(AtomicBool::new(true));

        let reader = {
            let alive = alive.clone();
            tokio::spawn(async move {
                read_loop(BufReader::new(stdout), incoming).await;
                alive.store(false, Ordering::SeqCst);
            })
        };

        // Drain stderr so the child cannot block on a full pipe.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "MCP server stderr");
            }
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            alive,
            reader: Mutex::new(Some(reader)),
        })
    }
}

/// Read newline-delimited JSON-RPC messages until EOF, skipping empty and
/// non-JSON lines (e.g. logging leaking onto stdout). Gives up after
/// [`MAX_SKIP_LINES`] skips to avoid spinning on a misbehaving server.
async fn read_loop<R>(reader: BufReader<R>, incoming: IncomingTx)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut skipped = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !trimmed.starts_with('{') {
                    skipped += 1;
                    if skipped >= MAX_SKIP_LINES {
                        tracing::warn!("MCP server produced too many non-JSON lines on stdout");
                        break;
                    }
                    tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
                    continue;
                }
                match IncomingMessage::from_str(trimmed) {
                    Ok(msg) => {
                        if incoming.send(msg).is_err() {
                            // Receiver gone: the client was closed.
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "failed to parse message from MCP server");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "error reading MCP server stdout");
                break;
            }
        }
    }
    // Dropping `incoming` here is the close signal for the client.
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let json = serde_json::to_string(&message)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);

        // Close stdin to signal the process to exit.
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for MCP server process");
            }
            Err(_) => {
                tracing::warn!("MCP server process did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn run_reader(input: &str) -> Vec<IncomingMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(BufReader::new(input.as_bytes()), tx).await;
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn reader_parses_messages_and_skips_noise() {
        let input = concat!(
            "starting up...\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n",
            "not json either\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/prompts/list_changed\"}\n",
        );
        let messages = run_reader(input).await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], IncomingMessage::Response(_)));
        assert!(matches!(messages[1], IncomingMessage::Notification(_)));
    }

    #[tokio::test]
    async fn reader_classifies_server_requests() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":\"e1\",\"method\":\"elicitation/create\",\"params\":{}}\n";
        let messages = run_reader(input).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], IncomingMessage::Request(_)));
    }

    #[tokio::test]
    async fn reader_stops_at_eof_and_drops_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_loop(BufReader::new(&b""[..]), tx).await;
        // Sender dropped: the channel reports closed, which the client
        // treats as transport close.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_io_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = StdioServerConfig {
            command: "/nonexistent/definitely-not-a-command".into(),
            args: vec![],
            env: Default::default(),
            common: Default::default(),
        };
        let err = StdioTransport::spawn(&config, tx).unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
