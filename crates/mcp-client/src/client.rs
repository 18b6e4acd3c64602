//! Per-server protocol client.
//!
//! An [`McpClient`] owns one live transport and everything that makes it a
//! JSON-RPC peer: request/response correlation by id, per-request
//! timeouts, and a dispatch task that routes inbound traffic — responses
//! to their waiting callers, notifications to a swappable sink, and
//! server-initiated requests (elicitation, ping) to their handlers. The
//! dispatch task ends when the transport drops its incoming sender, which
//! fails all pending requests and fires the close callback exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use eb_domain::ServerName;

use crate::error::{McpError, Result};
use crate::protocol::{
    call_tool_params, methods, CallToolResult, GetPromptResult, IncomingMessage, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, OutgoingMessage, ReadResourceResult,
    ToolsListResult, INTERNAL_ERROR, METHOD_NOT_FOUND,
};
use crate::transport::{IncomingRx, Transport, TransportError, TransportKind};

/// Receives every notification from the server. Swappable so the manager
/// can re-attach its dispatcher to a fresh client after reconnect.
pub type NotificationSink = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Answers an incoming elicitation request with structured user input.
pub type ElicitationResponder =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// Invoked once when the transport closes underneath the client.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

struct ClientShared {
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    notification_sink: parking_lot::Mutex<Option<NotificationSink>>,
    elicitation: parking_lot::Mutex<Option<ElicitationResponder>>,
    on_close: parking_lot::Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

/// A live protocol client for one named server.
pub struct McpClient {
    name: ServerName,
    transport: Arc<dyn Transport>,
    shared: Arc<ClientShared>,
    next_id: AtomicU64,
    default_timeout: Duration,
    server_info: parking_lot::Mutex<Option<InitializeResult>>,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Wire a client over an already-constructed transport and start its
    /// dispatch task. The handshake is a separate step ([`Self::initialize`]).
    pub fn new(
        name: ServerName,
        transport: Arc<dyn Transport>,
        incoming: IncomingRx,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let shared = Arc::new(ClientShared {
            pending: parking_lot::Mutex::new(HashMap::new()),
            notification_sink: parking_lot::Mutex::new(None),
            elicitation: parking_lot::Mutex::new(None),
            on_close: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let dispatch = tokio::spawn(dispatch_loop(
            name.clone(),
            Arc::clone(&transport),
            Arc::clone(&shared),
            incoming,
        ));

        Arc::new(Self {
            name,
            transport,
            shared,
            next_id: AtomicU64::new(1),
            default_timeout,
            server_info: parking_lot::Mutex::new(None),
            dispatch: parking_lot::Mutex::new(Some(dispatch)),
        })
    }

    pub fn server_name(&self) -> &ServerName {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    /// What the server reported during the handshake, once initialized.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn set_notification_sink(&self, sink: Option<NotificationSink>) {
        *self.shared.notification_sink.lock() = sink;
    }

    pub fn set_elicitation_responder(&self, responder: Option<ElicitationResponder>) {
        *self.shared.elicitation.lock() = responder;
    }

    /// Register the close callback. If the transport already closed, the
    /// callback fires immediately so a close in the registration window is
    /// never lost.
    pub fn set_on_close(&self, callback: CloseCallback) {
        if self.shared.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        *self.shared.on_close.lock() = Some(callback);
    }

    /// Issue one request and await its response within the timeout
    /// (per-call override, else the client default). A timeout fails the
    /// call but leaves the connection up.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(McpError::Transport(TransportError::Closed));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        tracing::debug!(server = %self.name, id, method, "sending MCP request");
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.transport.send(OutgoingMessage::Request(request)).await {
            self.shared.pending.lock().remove(&id);
            return Err(e.into());
        }

        let effective = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(effective, rx).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| McpError::Protocol(e.to_string())),
            Ok(Err(_)) => Err(McpError::Transport(TransportError::Closed)),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(McpError::Timeout(effective))
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(McpError::Transport(TransportError::Closed));
        }
        let notification = JsonRpcNotification::new(method, params);
        self.transport
            .send(OutgoingMessage::Notification(notification))
            .await?;
        Ok(())
    }

    /// Perform the MCP handshake: `initialize`, then the `initialized`
    /// notification.
    pub async fn initialize(
        &self,
        params: InitializeParams,
        timeout: Duration,
    ) -> Result<InitializeResult> {
        let raw = self
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params).map_err(TransportError::Json)?),
                Some(timeout),
            )
            .await?;
        let info: InitializeResult = decode(raw)?;
        *self.server_info.lock() = Some(info.clone());
        self.notify(crate::protocol::notifications::INITIALIZED, None)
            .await?;
        tracing::debug!(server = %self.name, "MCP handshake complete");
        Ok(info)
    }

    pub async fn list_tools(&self, timeout: Option<Duration>) -> Result<ToolsListResult> {
        decode(self.request(methods::TOOLS_LIST, None, timeout).await?)
    }

    /// Call a tool, wrapping the arguments in the standard invocation
    /// envelope.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = call_tool_params(tool, arguments);
        decode(
            self.request(methods::TOOLS_CALL, Some(params), timeout)
                .await?,
        )
    }

    pub async fn list_resources(&self, timeout: Option<Duration>) -> Result<ListResourcesResult> {
        decode(self.request(methods::RESOURCES_LIST, None, timeout).await?)
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult> {
        let params = serde_json::json!({ "uri": uri });
        decode(
            self.request(methods::RESOURCES_READ, Some(params), timeout)
                .await?,
        )
    }

    pub async fn subscribe_resource(&self, uri: &str, timeout: Option<Duration>) -> Result<()> {
        let params = serde_json::json!({ "uri": uri });
        self.request(methods::RESOURCES_SUBSCRIBE, Some(params), timeout)
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str, timeout: Option<Duration>) -> Result<()> {
        let params = serde_json::json!({ "uri": uri });
        self.request(methods::RESOURCES_UNSUBSCRIBE, Some(params), timeout)
            .await?;
        Ok(())
    }

    pub async fn list_resource_templates(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ListResourceTemplatesResult> {
        decode(
            self.request(methods::RESOURCE_TEMPLATES_LIST, None, timeout)
                .await?,
        )
    }

    pub async fn list_prompts(&self, timeout: Option<Duration>) -> Result<ListPromptsResult> {
        decode(self.request(methods::PROMPTS_LIST, None, timeout).await?)
    }

    pub async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<GetPromptResult> {
        let mut params = serde_json::Map::new();
        params.insert("name".into(), Value::String(prompt.into()));
        if let Some(arguments) = arguments {
            params.insert("arguments".into(), arguments);
        }
        decode(
            self.request(methods::PROMPTS_GET, Some(Value::Object(params)), timeout)
                .await?,
        )
    }

    pub async fn ping(&self, timeout: Option<Duration>) -> Result<()> {
        self.request(methods::PING, None, timeout).await?;
        Ok(())
    }

    /// Tear the client down: stop dispatch, fail pending requests, close
    /// the transport. The close callback is cleared first — an explicit
    /// close is the caller's decision, not a transport event.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        *self.shared.on_close.lock() = None;
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
        fail_pending(&self.shared);
        self.transport.close().await;
    }
}

/// Drop every pending sender, waking the waiting requesters with a
/// closed-channel error.
fn fail_pending(shared: &ClientShared) {
    shared.pending.lock().clear();
}

async fn dispatch_loop(
    name: ServerName,
    transport: Arc<dyn Transport>,
    shared: Arc<ClientShared>,
    mut incoming: IncomingRx,
) {
    while let Some(message) = incoming.recv().await {
        match message {
            IncomingMessage::Response(response) => {
                let slot = response
                    .id
                    .as_u64()
                    .and_then(|id| shared.pending.lock().remove(&id));
                match slot {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(server = %name, id = ?response.id, "response for unknown request id");
                    }
                }
            }
            IncomingMessage::Notification(notification) => {
                let sink = shared.notification_sink.lock().clone();
                match sink {
                    Some(sink) => sink(notification),
                    None => {
                        tracing::debug!(server = %name, method = %notification.method, "dropping unhandled notification");
                    }
                }
            }
            IncomingMessage::Request(request) => {
                // Answered off the dispatch task so a slow elicitation
                // handler cannot stall response routing.
                let transport = Arc::clone(&transport);
                let shared = Arc::clone(&shared);
                let name = name.clone();
                tokio::spawn(async move {
                    handle_server_request(name, transport, shared, request).await;
                });
            }
        }
    }

    // All transport senders gone: the connection is dead.
    shared.closed.store(true, Ordering::SeqCst);
    fail_pending(&shared);
    let callback = shared.on_close.lock().take();
    if let Some(callback) = callback {
        tracing::debug!(server = %name, "transport closed, running close callback");
        callback();
    }
}

async fn handle_server_request(
    name: ServerName,
    transport: Arc<dyn Transport>,
    shared: Arc<ClientShared>,
    request: JsonRpcRequest,
) {
    let reply = match request.method.as_str() {
        methods::PING => JsonRpcResponse::success(request.id, serde_json::json!({})),
        methods::ELICITATION_CREATE => {
            let responder = shared.elicitation.lock().clone();
            match responder {
                Some(responder) => {
                    let params = request.params.unwrap_or(Value::Null);
                    match responder(params).await {
                        Ok(value) => JsonRpcResponse::success(request.id, value),
                        Err(message) => {
                            JsonRpcResponse::failure(request.id, INTERNAL_ERROR, message)
                        }
                    }
                }
                None => JsonRpcResponse::failure(
                    request.id,
                    METHOD_NOT_FOUND,
                    "no elicitation handler registered",
                ),
            }
        }
        other => JsonRpcResponse::failure(
            request.id.clone(),
            METHOD_NOT_FOUND,
            format!("unsupported request: {other}"),
        ),
    };

    if let Err(e) = transport.send(OutgoingMessage::Response(reply)).await {
        tracing::debug!(server = %name, error = %e, "failed to answer server request");
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| McpError::Protocol(format!("unexpected result shape: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
