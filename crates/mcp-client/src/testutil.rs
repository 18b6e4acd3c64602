//! In-memory transport double shared by client and manager tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use eb_domain::ServerName;

use crate::client::McpClient;
use crate::protocol::{IncomingMessage, JsonRpcResponse, OutgoingMessage};
use crate::transport::{IncomingTx, Transport, TransportError, TransportKind};

enum CannedReply {
    Success(Value),
    Error(i64, String),
}

/// A transport that records everything sent and auto-responds to requests.
///
/// By default every request gets an empty-object success response; tests
/// can pin a per-method result or error, swallow requests entirely (to
/// exercise timeouts), inject arbitrary inbound messages, and drop the
/// inbound sender to simulate a remote close.
pub(crate) struct FakeTransport {
    kind: TransportKind,
    session: parking_lot::Mutex<Option<String>>,
    sent: parking_lot::Mutex<Vec<OutgoingMessage>>,
    incoming: parking_lot::Mutex<Option<IncomingTx>>,
    replies: parking_lot::Mutex<HashMap<String, CannedReply>>,
    swallow: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            session: parking_lot::Mutex::new(None),
            sent: parking_lot::Mutex::new(Vec::new()),
            incoming: parking_lot::Mutex::new(None),
            replies: parking_lot::Mutex::new(HashMap::new()),
            swallow: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_session(&self, session: &str) {
        *self.session.lock() = Some(session.to_string());
    }

    /// Canned success result for the given method.
    pub(crate) fn respond_with(&self, method: &str, result: Value) {
        self.replies
            .lock()
            .insert(method.to_string(), CannedReply::Success(result));
    }

    /// Canned error response for the given method.
    pub(crate) fn fail_with(&self, method: &str, code: i64, message: &str) {
        self.replies.lock().insert(
            method.to_string(),
            CannedReply::Error(code, message.to_string()),
        );
    }

    /// Record requests without responding, so callers time out.
    pub(crate) fn swallow_requests(&self) {
        self.swallow.store(true, Ordering::SeqCst);
    }

    /// Push an inbound message, as if the server sent it.
    pub(crate) fn inject(&self, message: IncomingMessage) {
        if let Some(tx) = &*self.incoming.lock() {
            let _ = tx.send(message);
        }
    }

    /// Drop the inbound sender: the client observes a transport close.
    pub(crate) fn disconnect(&self) {
        self.incoming.lock().take();
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().clone()
    }

    /// Wait (bounded) until the client has sent a JSON-RPC response, and
    /// return the most recent one.
    pub(crate) async fn wait_for_response(&self) -> JsonRpcResponse {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let found = self.sent.lock().iter().rev().find_map(|m| match m {
                OutgoingMessage::Response(r) => Some(r.clone()),
                _ => None,
            });
            if let Some(response) = found {
                return response;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no response sent within deadline");
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        self.sent.lock().push(message.clone());

        if let OutgoingMessage::Request(request) = message {
            if self.swallow.load(Ordering::SeqCst) {
                return Ok(());
            }
            let response = match self.replies.lock().get(&request.method) {
                Some(CannedReply::Success(result)) => {
                    JsonRpcResponse::success(request.id, result.clone())
                }
                Some(CannedReply::Error(code, message)) => {
                    JsonRpcResponse::failure(request.id, *code, message.clone())
                }
                None => JsonRpcResponse::success(request.id, serde_json::json!({})),
            };
            if let Some(tx) = &*self.incoming.lock() {
                let _ = tx.send(IncomingMessage::Response(response));
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn session_id(&self) -> Option<String> {
        self.session.lock().clone()
    }

    async fn close(&self) {
        self.incoming.lock().take();
    }
}

/// Build a client wired to a fresh [`FakeTransport`].
pub(crate) fn fake_client(name: &str, kind: TransportKind) -> (Arc<McpClient>, Arc<FakeTransport>) {
    let fake = FakeTransport::new(kind);
    let (tx, rx) = mpsc::unbounded_channel();
    *fake.incoming.lock() = Some(tx);
    let client = McpClient::new(
        ServerName::new(name).unwrap(),
        fake.clone(),
        rx,
        Duration::from_secs(5),
    );
    (client, fake)
}
