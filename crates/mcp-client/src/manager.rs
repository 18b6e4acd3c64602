//! Connection manager — owns every MCP server connection and routes the
//! uniform operation surface (tools, resources, prompts, ping) to the
//! right client.
//!
//! The registry is the single shared mutable resource. It is only ever
//! locked for map lookups and mutations, never across an await, so no
//! caller can observe a half-updated entry. Concurrent connects to the
//! same name share one in-flight future; connects to different names are
//! fully independent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;

use eb_domain::{
    HttpServerConfig, ManagerOptions, McpConfig, ServerConfig, ServerName, StdioServerConfig,
};

use crate::client::{ElicitationResponder, McpClient};
use crate::error::{ConnectError, McpError, Result, SharedConnectError};
use crate::protocol::{
    initialize_params, merge_capabilities, notifications, CallToolResult, GetPromptResult,
    JsonRpcNotification, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ReadResourceResult, ToolDef, ToolsListResult,
};
use crate::transport::{
    SseTransport, StdioTransport, StreamableHttpTransport, Transport, TransportKind,
};

/// Ceiling on the first leg of the two-phase HTTP connect: a doomed
/// streamable-HTTP attempt must not delay the SSE fallback longer than this.
const STREAMABLE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Handles one notification's params. Multiple handlers may be registered
/// per (server, method); all are invoked, and a panicking handler cannot
/// block delivery to the others.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Answers elicitation requests for one server. At most one per server.
pub type ElicitationHandler = ElicitationResponder;

type ConnectFuture =
    Shared<BoxFuture<'static, std::result::Result<Arc<McpClient>, SharedConnectError>>>;

/// Per-server registry record. The config survives a failed or closed
/// connection so the caller can reconnect without resupplying it.
struct ConnectionEntry {
    config: ServerConfig,
    timeout: Duration,
    client: Option<Arc<McpClient>>,
    /// De-duplicates concurrent connects: later callers await this same
    /// future instead of starting a second attempt.
    pending: Option<ConnectFuture>,
}

struct ManagerInner {
    options: ManagerOptions,
    registry: parking_lot::Mutex<HashMap<ServerName, ConnectionEntry>>,
    /// server -> notification method -> handlers. Kept outside the
    /// registry entry so handlers survive reconnect.
    notification_handlers:
        parking_lot::Mutex<HashMap<ServerName, HashMap<String, Vec<NotificationHandler>>>>,
    elicitation_handlers: parking_lot::Mutex<HashMap<ServerName, ElicitationHandler>>,
    /// server -> tool -> `_meta`, captured on every tools/list.
    tool_meta: parking_lot::Mutex<HashMap<ServerName, HashMap<String, Value>>>,
}

/// Owns a registry of named MCP server connections and multiplexes the
/// uniform operation surface over them.
pub struct ClientConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ClientConnectionManager {
    /// Create the manager and kick off a connection attempt for every
    /// configured server. The attempts run as detached tasks: construction
    /// never blocks, and a failed initial connect is logged and skipped
    /// (the server stays absent until retried). Must be called within a
    /// tokio runtime.
    pub fn new(config: McpConfig, options: ManagerOptions) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                options,
                registry: parking_lot::Mutex::new(HashMap::new()),
                notification_handlers: parking_lot::Mutex::new(HashMap::new()),
                elicitation_handlers: parking_lot::Mutex::new(HashMap::new()),
                tool_meta: parking_lot::Mutex::new(HashMap::new()),
            }),
        };

        for (raw_name, server_config) in config.servers {
            let inner = Arc::clone(&manager.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.connect_to(&raw_name, server_config).await {
                    tracing::warn!(
                        server = %raw_name,
                        error = %e,
                        "failed to connect to MCP server, skipping"
                    );
                }
            });
        }

        manager
    }

    /// Create an empty manager (no servers configured).
    pub fn empty() -> Self {
        Self::new(McpConfig::default(), ManagerOptions::default())
    }

    /// Connect to a server, registering it under `name`. Idempotent: a
    /// second call for an already-connected name returns the existing
    /// client, and concurrent calls share a single underlying attempt.
    pub async fn connect_to_server(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<Arc<McpClient>> {
        self.inner.connect_to(name, config).await
    }

    /// Names of the currently connected servers.
    pub fn list_servers(&self) -> Vec<ServerName> {
        let registry = self.inner.registry.lock();
        let mut names: Vec<ServerName> = registry
            .iter()
            .filter(|(_, entry)| entry.client.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_server(&self, name: &str) -> bool {
        let Ok(name) = ServerName::new(name) else {
            return false;
        };
        self.inner
            .registry
            .lock()
            .get(&name)
            .is_some_and(|entry| entry.client.is_some())
    }

    /// The live client handle, if connected. Callers may issue protocol
    /// calls through it but must not close it — closing is the manager's
    /// job ([`Self::disconnect_server`]).
    pub fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        let name = ServerName::new(name).ok()?;
        self.inner
            .registry
            .lock()
            .get(&name)
            .and_then(|entry| entry.client.clone())
    }

    /// Close a server's connection and forget it entirely: registry entry,
    /// notification handlers, elicitation handler, and cached tool
    /// metadata. A later reconnect under the same name starts from a clean
    /// slate.
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let name = ServerName::new(name)?;
        let client = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .get(&name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            entry
                .client
                .clone()
                .ok_or_else(|| McpError::NotConnected(name.to_string()))?
        };

        // Close is best-effort; the cleanup below happens regardless.
        client.close().await;

        self.inner.forget_connection(&name);
        self.inner.notification_handlers.lock().remove(&name);
        self.inner.elicitation_handlers.lock().remove(&name);
        tracing::info!(server = %name, "MCP server disconnected");
        Ok(())
    }

    /// Disconnect every registered server concurrently, then purge any
    /// handler state left behind.
    pub async fn disconnect_all_servers(&self) {
        let names: Vec<ServerName> = self.inner.registry.lock().keys().cloned().collect();

        let disconnects = names.iter().map(|name| async move {
            if let Err(e) = self.disconnect_server(name.as_str()).await {
                tracing::debug!(server = %name, error = %e, "disconnect during shutdown failed");
            }
        });
        futures_util::future::join_all(disconnects).await;

        for name in &names {
            self.inner.notification_handlers.lock().remove(name);
            self.inner.elicitation_handlers.lock().remove(name);
        }
    }

    // ──────────────────────────────────────────────────────────────
    // Uniform per-server operations
    // ──────────────────────────────────────────────────────────────

    /// List a server's tools, refreshing the per-tool metadata cache.
    pub async fn list_tools(
        &self,
        server: &str,
        timeout: Option<Duration>,
    ) -> Result<ToolsListResult> {
        let client = self.ensure_connected(server).await?;
        let result = client.list_tools(timeout).await?;
        self.inner
            .cache_tool_metadata(client.server_name(), &result);
        Ok(result)
    }

    /// Flattened `(server, tool)` list across the named servers, or all
    /// registered servers when `servers` is omitted.
    pub async fn get_tools(
        &self,
        servers: Option<&[&str]>,
    ) -> Result<Vec<(ServerName, ToolDef)>> {
        let targets: Vec<String> = match servers {
            Some(list) => list.iter().map(|s| s.to_string()).collect(),
            None => {
                let mut names: Vec<String> = self
                    .inner
                    .registry
                    .lock()
                    .keys()
                    .map(|n| n.to_string())
                    .collect();
                names.sort();
                names
            }
        };

        let fetches = targets.iter().map(|server| async move {
            let name = ServerName::new(server)?;
            let tools = self.list_tools(server, None).await?;
            Ok::<_, McpError>((name, tools.tools))
        });

        let mut flat = Vec::new();
        for fetched in futures_util::future::join_all(fetches).await {
            let (name, tools) = fetched?;
            for tool in tools {
                flat.push((name.clone(), tool));
            }
        }
        Ok(flat)
    }

    /// Call a tool on a named server. Arguments are wrapped in the
    /// standard tool-invocation envelope.
    pub async fn execute_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let client = self.ensure_connected(server).await?;
        client.call_tool(tool, arguments, timeout).await
    }

    pub async fn list_resources(
        &self,
        server: &str,
        timeout: Option<Duration>,
    ) -> Result<ListResourcesResult> {
        let client = self.ensure_connected(server).await?;
        client.list_resources(timeout).await
    }

    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult> {
        let client = self.ensure_connected(server).await?;
        client.read_resource(uri, timeout).await
    }

    pub async fn subscribe_resource(
        &self,
        server: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let client = self.ensure_connected(server).await?;
        client.subscribe_resource(uri, timeout).await
    }

    pub async fn unsubscribe_resource(
        &self,
        server: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let client = self.ensure_connected(server).await?;
        client.unsubscribe_resource(uri, timeout).await
    }

    pub async fn list_resource_templates(
        &self,
        server: &str,
        timeout: Option<Duration>,
    ) -> Result<ListResourceTemplatesResult> {
        let client = self.ensure_connected(server).await?;
        client.list_resource_templates(timeout).await
    }

    pub async fn list_prompts(
        &self,
        server: &str,
        timeout: Option<Duration>,
    ) -> Result<ListPromptsResult> {
        let client = self.ensure_connected(server).await?;
        client.list_prompts(timeout).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        prompt: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<GetPromptResult> {
        let client = self.ensure_connected(server).await?;
        client.get_prompt(prompt, arguments, timeout).await
    }

    pub async fn ping_server(&self, server: &str, timeout: Option<Duration>) -> Result<()> {
        let client = self.ensure_connected(server).await?;
        client.ping(timeout).await
    }

    /// The streamable-HTTP session id. Hard error on any other transport.
    pub async fn get_session_id(&self, server: &str) -> Result<Option<String>> {
        let client = self.ensure_connected(server).await?;
        match client.kind() {
            TransportKind::StreamableHttp => Ok(client.session_id()),
            actual => Err(McpError::WrongTransport {
                server: client.server_name().to_string(),
                actual,
                required: TransportKind::StreamableHttp,
            }),
        }
    }

    /// Cached per-tool `_meta` for a server, as captured by the most
    /// recent `list_tools` — no round trip.
    pub fn get_all_tools_metadata(&self, server: &str) -> HashMap<String, Value> {
        let Ok(name) = ServerName::new(server) else {
            return HashMap::new();
        };
        self.inner
            .tool_meta
            .lock()
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    // ──────────────────────────────────────────────────────────────
    // Notification and elicitation handlers
    // ──────────────────────────────────────────────────────────────

    /// Register a handler for one notification method on one server.
    /// Handlers may be registered before the server ever connects, and
    /// they survive reconnects; every registered handler for a method is
    /// invoked on delivery.
    pub fn add_notification_handler(
        &self,
        server: &str,
        method: &str,
        handler: NotificationHandler,
    ) -> Result<()> {
        let name = ServerName::new(server)?;
        self.inner
            .notification_handlers
            .lock()
            .entry(name)
            .or_default()
            .entry(method.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    pub fn on_resource_list_changed(
        &self,
        server: &str,
        handler: NotificationHandler,
    ) -> Result<()> {
        self.add_notification_handler(server, notifications::RESOURCES_LIST_CHANGED, handler)
    }

    pub fn on_resource_updated(&self, server: &str, handler: NotificationHandler) -> Result<()> {
        self.add_notification_handler(server, notifications::RESOURCES_UPDATED, handler)
    }

    pub fn on_prompt_list_changed(&self, server: &str, handler: NotificationHandler) -> Result<()> {
        self.add_notification_handler(server, notifications::PROMPTS_LIST_CHANGED, handler)
    }

    /// Install the elicitation handler for a server. The server must
    /// already be known (at least one connect attempt); the handler is
    /// re-attached to every new client instance for the name.
    pub fn set_elicitation_handler(&self, server: &str, handler: ElicitationHandler) -> Result<()> {
        let name = ServerName::new(server)?;
        if !self.inner.registry.lock().contains_key(&name) {
            return Err(McpError::UnknownServer(name.to_string()));
        }
        self.inner
            .elicitation_handlers
            .lock()
            .insert(name.clone(), handler.clone());
        if let Some(client) = self.client_for(&name) {
            client.set_elicitation_responder(Some(handler));
        }
        Ok(())
    }

    /// Remove the elicitation handler; a connected client stops answering
    /// elicitation requests immediately.
    pub fn clear_elicitation_handler(&self, server: &str) -> Result<()> {
        let name = ServerName::new(server)?;
        self.inner.elicitation_handlers.lock().remove(&name);
        if let Some(client) = self.client_for(&name) {
            client.set_elicitation_responder(None);
        }
        Ok(())
    }

    // ──────────────────────────────────────────────────────────────
    // Internals
    // ──────────────────────────────────────────────────────────────

    fn client_for(&self, name: &ServerName) -> Option<Arc<McpClient>> {
        self.inner
            .registry
            .lock()
            .get(name)
            .and_then(|entry| entry.client.clone())
    }

    /// Resolve a live client for an operation: await an in-flight connect,
    /// reconnect from the stored config if the server is known but down,
    /// or fail with `UnknownServer` for a name never registered.
    async fn ensure_connected(&self, server: &str) -> Result<Arc<McpClient>> {
        let name = ServerName::new(server)?;
        let (client, pending, config) = {
            let registry = self.inner.registry.lock();
            let entry = registry
                .get(&name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            (
                entry.client.clone(),
                entry.pending.clone(),
                entry.config.clone(),
            )
        };

        if let Some(client) = client {
            return Ok(client);
        }
        if let Some(pending) = pending {
            return pending
                .await
                .map_err(|e| McpError::Connect((*e).clone()));
        }
        self.inner.connect_to(name.as_str(), config).await
    }

    #[cfg(test)]
    fn inject_client(&self, name: &str, client: Arc<McpClient>, config: ServerConfig) {
        let name = ServerName::new(name).unwrap();
        self.inner.attach_hooks(&name, &client);
        self.inner.attach_on_close(&name, &client);
        self.inner.registry.lock().insert(
            name,
            ConnectionEntry {
                config,
                timeout: self.inner.options.request_timeout(),
                client: Some(client),
                pending: None,
            },
        );
    }
}

impl ManagerInner {
    async fn connect_to(
        self: &Arc<Self>,
        raw_name: &str,
        config: ServerConfig,
    ) -> Result<Arc<McpClient>> {
        let name = ServerName::new(raw_name)?;
        let timeout = config
            .timeout()
            .unwrap_or_else(|| self.options.request_timeout());

        let fut = {
            let mut registry = self.registry.lock();
            let entry = registry
                .entry(name.clone())
                .or_insert_with(|| ConnectionEntry {
                    config: config.clone(),
                    timeout,
                    client: None,
                    pending: None,
                });

            if let Some(client) = &entry.client {
                // Idempotent no-op connect.
                return Ok(Arc::clone(client));
            }
            if let Some(pending) = &entry.pending {
                pending.clone()
            } else {
                entry.config = config.clone();
                entry.timeout = timeout;
                let fut: ConnectFuture = {
                    let inner = Arc::clone(self);
                    let name = name.clone();
                    async move { inner.establish(name, config, timeout).await }
                        .boxed()
                        .shared()
                };
                entry.pending = Some(fut.clone());
                fut
            }
        };

        fut.await.map_err(|e| McpError::Connect((*e).clone()))
    }

    /// The single underlying connection attempt behind the shared future.
    /// Clears the pending slot and stores (or clears) the client in one
    /// registry mutation, so a waiter can never see a cleared slot without
    /// the final state.
    async fn establish(
        self: Arc<Self>,
        name: ServerName,
        config: ServerConfig,
        timeout: Duration,
    ) -> std::result::Result<Arc<McpClient>, SharedConnectError> {
        let result = self.open_client(&name, &config, timeout).await;

        let mut registry = self.registry.lock();
        match result {
            Ok(client) => {
                if let Some(entry) = registry.get_mut(&name) {
                    entry.pending = None;
                    entry.client = Some(Arc::clone(&client));
                }
                tracing::info!(server = %name, transport = %client.kind(), "MCP server connected");
                Ok(client)
            }
            Err(e) => {
                if let Some(entry) = registry.get_mut(&name) {
                    entry.pending = None;
                    entry.client = None;
                }
                tracing::warn!(server = %name, error = %e, "MCP connect failed");
                let connect_err = match e {
                    McpError::Connect(ce) => ce,
                    other => ConnectError::new(name.as_str(), other.to_string()),
                };
                Err(Arc::new(connect_err))
            }
        }
    }

    /// Dispatch to the transport-specific connect routine.
    async fn open_client(
        self: &Arc<Self>,
        name: &ServerName,
        config: &ServerConfig,
        timeout: Duration,
    ) -> Result<Arc<McpClient>> {
        match config {
            ServerConfig::Stdio(stdio) => self.connect_stdio(name, stdio, timeout).await,
            ServerConfig::Http(http) => {
                if prefers_streamable(http) {
                    // Fail fast on the modern protocol so a doomed attempt
                    // cannot block the fallback for the full timeout.
                    let probe = timeout.min(STREAMABLE_PROBE_TIMEOUT);
                    match self.connect_streamable(name, http, probe, timeout).await {
                        Ok(client) => Ok(client),
                        Err(streamable_err) => {
                            tracing::debug!(
                                server = %name,
                                error = %streamable_err,
                                "streamable HTTP connect failed, falling back to SSE"
                            );
                            match self.connect_sse(name, http, timeout).await {
                                Ok(client) => Ok(client),
                                Err(sse_err) => Err(McpError::Connect(ConnectError::new(
                                    name.as_str(),
                                    format!(
                                        "streamable HTTP: {streamable_err}; SSE fallback: {sse_err}"
                                    ),
                                ))),
                            }
                        }
                    }
                } else {
                    self.connect_sse(name, http, timeout).await
                }
            }
        }
    }

    async fn connect_stdio(
        self: &Arc<Self>,
        name: &ServerName,
        config: &StdioServerConfig,
        timeout: Duration,
    ) -> Result<Arc<McpClient>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::new(StdioTransport::spawn(config, tx)?);
        self.finish_connect(name, transport, rx, config.common.capabilities.as_ref(),
            config.common.protocol_version.as_deref(), timeout, timeout)
            .await
    }

    async fn connect_sse(
        self: &Arc<Self>,
        name: &ServerName,
        config: &HttpServerConfig,
        timeout: Duration,
    ) -> Result<Arc<McpClient>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = tokio::time::timeout(timeout, SseTransport::connect(config, tx))
            .await
            .map_err(|_| McpError::Timeout(timeout))??;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        self.finish_connect(name, transport, rx, config.common.capabilities.as_ref(),
            config.common.protocol_version.as_deref(), timeout, timeout)
            .await
    }

    async fn connect_streamable(
        self: &Arc<Self>,
        name: &ServerName,
        config: &HttpServerConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<McpClient>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = StreamableHttpTransport::connect(config, tx)?;
        self.finish_connect(name, transport, rx, config.common.capabilities.as_ref(),
            config.common.protocol_version.as_deref(), connect_timeout, request_timeout)
            .await
    }

    /// Wire a client over the transport, re-attach stored handlers, and
    /// run the handshake. On handshake failure the client (and its child
    /// process or sockets) is torn down before the error propagates.
    #[allow(clippy::too_many_arguments)]
    async fn finish_connect(
        self: &Arc<Self>,
        name: &ServerName,
        transport: Arc<dyn Transport>,
        incoming: crate::transport::IncomingRx,
        capabilities: Option<&Value>,
        protocol_version: Option<&str>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<McpClient>> {
        let client = McpClient::new(name.clone(), transport, incoming, request_timeout);
        self.attach_hooks(name, &client);

        let version = protocol_version.unwrap_or(&self.options.protocol_version);
        let capabilities = merge_capabilities(self.options.capabilities.as_ref(), capabilities);
        let params = initialize_params(version, capabilities);

        match client.initialize(params, connect_timeout).await {
            Ok(_) => {
                self.attach_on_close(name, &client);
                Ok(client)
            }
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Attach the notification dispatcher and any stored elicitation
    /// handler. The dispatcher consults the handler map at delivery time,
    /// so handlers added later are seen without re-attachment.
    fn attach_hooks(self: &Arc<Self>, name: &ServerName, client: &Arc<McpClient>) {
        let weak = Arc::downgrade(self);
        let sink_name = name.clone();
        client.set_notification_sink(Some(Arc::new(move |notification: JsonRpcNotification| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_notification(&sink_name, notification);
            }
        })));

        let responder = self.elicitation_handlers.lock().get(name).cloned();
        client.set_elicitation_responder(responder);
    }

    /// A transport-level close (remote hangup, process death) erases the
    /// registry entry so a dead connection is never silently reused.
    /// Handlers stay registered — they survive reconnect.
    fn attach_on_close(self: &Arc<Self>, name: &ServerName, client: &Arc<McpClient>) {
        let weak = Arc::downgrade(self);
        let close_name = name.clone();
        client.set_on_close(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                tracing::debug!(server = %close_name, "transport closed, forgetting connection");
                inner.forget_connection(&close_name);
            }
        }));
    }

    fn forget_connection(&self, name: &ServerName) {
        self.registry.lock().remove(name);
        self.tool_meta.lock().remove(name);
    }

    fn dispatch_notification(&self, name: &ServerName, notification: JsonRpcNotification) {
        let handlers = {
            let map = self.notification_handlers.lock();
            map.get(name)
                .and_then(|methods| methods.get(&notification.method))
                .cloned()
        };
        let Some(handlers) = handlers else {
            tracing::debug!(server = %name, method = %notification.method, "no handlers for notification");
            return;
        };

        let params = notification.params.unwrap_or(Value::Null);
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(params.clone())
            }));
            if outcome.is_err() {
                tracing::warn!(
                    server = %name,
                    method = %notification.method,
                    "notification handler panicked, continuing delivery"
                );
            }
        }
    }

    fn cache_tool_metadata(&self, name: &ServerName, result: &ToolsListResult) {
        let metadata: HashMap<String, Value> = result
            .tools
            .iter()
            .filter_map(|tool| tool.meta.clone().map(|meta| (tool.name.clone(), meta)))
            .collect();
        self.tool_meta.lock().insert(name.clone(), metadata);
    }
}

/// Decide the preferred HTTP sub-protocol: the explicit config flag wins;
/// otherwise a URL path ending in the legacy `/sse` suffix means SSE.
fn prefers_streamable(config: &HttpServerConfig) -> bool {
    match config.prefer_sse {
        Some(true) => false,
        Some(false) => true,
        None => match config.url.parse::<reqwest::Url>() {
            Ok(url) => !url.path().ends_with("/sse"),
            Err(_) => true,
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{methods, IncomingMessage, JsonRpcRequest, OutgoingMessage};
    use crate::testutil::fake_client;
    use futures_util::FutureExt as _;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stdio_config(command: &str, args: &[&str], timeout_ms: Option<u64>) -> ServerConfig {
        ServerConfig::Stdio(StdioServerConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Default::default(),
            common: eb_domain::config::CommonServerConfig {
                timeout_ms,
                ..Default::default()
            },
        })
    }

    fn http_config(url: &str, prefer_sse: Option<bool>) -> HttpServerConfig {
        HttpServerConfig {
            url: url.into(),
            prefer_sse,
            headers: Default::default(),
            session_id: None,
            reconnect: Default::default(),
            common: Default::default(),
        }
    }

    #[tokio::test]
    async fn operations_on_unregistered_name_fail_with_unknown_server() {
        let manager = ClientConnectionManager::empty();
        let err = manager.list_tools("ghost", None).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));
        let err = manager.disconnect_server("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn blank_server_name_is_rejected() {
        let manager = ClientConnectionManager::empty();
        let err = manager
            .connect_to_server("   ", stdio_config("true", &[], None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidServerName(_)));
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        // `cat` echoes our handshake back, which fails the connect quickly
        // and deterministically; the marker file counts actual spawns.
        let script = format!("echo spawned >> {}; exec cat", marker.display());
        let config = stdio_config("/bin/sh", &["-c", script.as_str()], Some(2_000));

        let manager = ClientConnectionManager::empty();
        let (a, b) = tokio::join!(
            manager.connect_to_server("dup", config.clone()),
            manager.connect_to_server("dup", config.clone()),
        );
        assert!(matches!(a.unwrap_err(), McpError::Connect(_)));
        assert!(matches!(b.unwrap_err(), McpError::Connect(_)));

        let mut contents = String::new();
        std::fs::File::open(&marker)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 1, "exactly one spawn for two callers");

        // The failure cleared the pending slot: a retry starts a fresh attempt.
        let retry = manager.connect_to_server("dup", config).await;
        assert!(retry.is_err());
        contents.clear();
        std::fs::File::open(&marker)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn connect_is_idempotent_for_live_servers() {
        let manager = ClientConnectionManager::empty();
        let (client, _fake) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", Arc::clone(&client), stdio_config("true", &[], None));

        let again = manager
            .connect_to_server("files", stdio_config("something-else", &[], None))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&client, &again));
    }

    #[tokio::test]
    async fn known_but_disconnected_server_reconnects_from_stored_config() {
        let manager = ClientConnectionManager::empty();
        // Known name, no client, stored config pointing at a dead command.
        manager.inner.registry.lock().insert(
            ServerName::new("files").unwrap(),
            ConnectionEntry {
                config: stdio_config("/nonexistent/not-a-command", &[], None),
                timeout: Duration::from_secs(1),
                client: None,
                pending: None,
            },
        );

        let err = manager.list_tools("files", None).await.unwrap_err();
        // The reconnect was attempted (spawn failure), not UnknownServer.
        assert!(matches!(err, McpError::Connect(_)));
    }

    #[tokio::test]
    async fn disconnect_forgets_the_server_completely() {
        let manager = ClientConnectionManager::empty();
        let (client, _fake) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", client, stdio_config("true", &[], None));
        manager
            .on_resource_updated("files", Arc::new(|_| {}))
            .unwrap();

        manager.disconnect_server("files").await.unwrap();

        assert!(!manager.has_server("files"));
        assert!(manager.list_servers().is_empty());
        assert!(manager
            .inner
            .notification_handlers
            .lock()
            .get(&ServerName::new("files").unwrap())
            .is_none());
        let err = manager
            .execute_tool("files", "x", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn disconnect_known_but_unconnected_server_is_not_connected() {
        let manager = ClientConnectionManager::empty();
        manager.inner.registry.lock().insert(
            ServerName::new("files").unwrap(),
            ConnectionEntry {
                config: stdio_config("true", &[], None),
                timeout: Duration::from_secs(1),
                client: None,
                pending: None,
            },
        );
        let err = manager.disconnect_server("files").await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected(_)));
    }

    #[tokio::test]
    async fn disconnect_all_servers_empties_the_registry() {
        let manager = ClientConnectionManager::empty();
        let (a, _fa) = fake_client("a", TransportKind::Stdio);
        let (b, _fb) = fake_client("b", TransportKind::Stdio);
        manager.inject_client("a", a, stdio_config("true", &[], None));
        manager.inject_client("b", b, stdio_config("true", &[], None));
        assert_eq!(manager.list_servers().len(), 2);

        manager.disconnect_all_servers().await;
        assert!(manager.list_servers().is_empty());
        assert!(manager.inner.notification_handlers.lock().is_empty());
        assert!(manager.inner.elicitation_handlers.lock().is_empty());
    }

    #[tokio::test]
    async fn notifications_reach_all_handlers_despite_a_panicking_one() {
        let manager = ClientConnectionManager::empty();
        manager
            .add_notification_handler(
                "files",
                notifications::RESOURCES_UPDATED,
                Arc::new(|_| panic!("bad handler")),
            )
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .add_notification_handler(
                "files",
                notifications::RESOURCES_UPDATED,
                Arc::new(move |params| {
                    let _ = tx.send(params);
                }),
            )
            .unwrap();

        let (client, fake) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", client, stdio_config("true", &[], None));

        fake.inject(IncomingMessage::Notification(
            crate::protocol::JsonRpcNotification::new(
                notifications::RESOURCES_UPDATED,
                Some(serde_json::json!({ "uri": "file:///a" })),
            ),
        ));

        let params = rx.recv().await.expect("second handler still invoked");
        assert_eq!(params["uri"], "file:///a");
    }

    #[tokio::test]
    async fn handlers_survive_remote_close_and_reconnect() {
        let manager = ClientConnectionManager::empty();
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&hits);
        manager
            .on_prompt_list_changed(
                "files",
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }),
            )
            .unwrap();

        // First connection.
        let (client_a, fake_a) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", client_a, stdio_config("true", &[], None));
        fake_a.inject(IncomingMessage::Notification(
            crate::protocol::JsonRpcNotification::new(notifications::PROMPTS_LIST_CHANGED, None),
        ));
        rx.recv().await.unwrap();

        // Remote close: the registry forgets the server, handlers stay.
        fake_a.disconnect();
        while manager.has_server("files") {
            tokio::task::yield_now().await;
        }

        // Reconnect under the same name: the handler fires again.
        let (client_b, fake_b) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", client_b, stdio_config("true", &[], None));
        fake_b.inject(IncomingMessage::Notification(
            crate::protocol::JsonRpcNotification::new(notifications::PROMPTS_LIST_CHANGED, None),
        ));
        rx.recv().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_tool_sends_the_invocation_envelope() {
        let manager = ClientConnectionManager::empty();
        let (client, fake) = fake_client("files", TransportKind::Stdio);
        fake.respond_with(methods::TOOLS_CALL, serde_json::json!({ "content": [] }));
        manager.inject_client("files", client, stdio_config("true", &[], None));

        manager
            .execute_tool("files", "foo", serde_json::json!({ "a": 1 }), None)
            .await
            .unwrap();

        let sent = fake.sent();
        let call = sent
            .iter()
            .find_map(|m| match m {
                OutgoingMessage::Request(r) if r.method == methods::TOOLS_CALL => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        let params = call.params.unwrap();
        assert_eq!(params["name"], "foo");
        assert_eq!(params["arguments"], serde_json::json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn session_id_requires_streamable_http() {
        let manager = ClientConnectionManager::empty();
        let (stdio_client, _f) = fake_client("local", TransportKind::Stdio);
        manager.inject_client("local", stdio_client, stdio_config("true", &[], None));

        let err = manager.get_session_id("local").await.unwrap_err();
        assert!(matches!(
            err,
            McpError::WrongTransport {
                required: TransportKind::StreamableHttp,
                ..
            }
        ));

        let (http_client, fake) = fake_client("remote", TransportKind::StreamableHttp);
        fake.set_session("sess-1");
        manager.inject_client(
            "remote",
            http_client,
            ServerConfig::Http(http_config("http://localhost/mcp", None)),
        );
        let session = manager.get_session_id("remote").await.unwrap();
        assert_eq!(session.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn tools_metadata_is_cached_and_cleared_on_close() {
        let manager = ClientConnectionManager::empty();
        let (client, fake) = fake_client("files", TransportKind::Stdio);
        fake.respond_with(
            methods::TOOLS_LIST,
            serde_json::json!({
                "tools": [
                    { "name": "search", "_meta": { "eval/category": "retrieval" } },
                    { "name": "plain" }
                ]
            }),
        );
        manager.inject_client("files", client, stdio_config("true", &[], None));

        manager.list_tools("files", None).await.unwrap();
        let metadata = manager.get_all_tools_metadata("files");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["search"]["eval/category"], "retrieval");

        fake.disconnect();
        while manager.has_server("files") {
            tokio::task::yield_now().await;
        }
        assert!(manager.get_all_tools_metadata("files").is_empty());
    }

    #[tokio::test]
    async fn get_tools_flattens_across_servers() {
        let manager = ClientConnectionManager::empty();
        let (a, fake_a) = fake_client("a", TransportKind::Stdio);
        fake_a.respond_with(
            methods::TOOLS_LIST,
            serde_json::json!({ "tools": [{ "name": "alpha" }] }),
        );
        let (b, fake_b) = fake_client("b", TransportKind::Stdio);
        fake_b.respond_with(
            methods::TOOLS_LIST,
            serde_json::json!({ "tools": [{ "name": "beta" }, { "name": "gamma" }] }),
        );
        manager.inject_client("a", a, stdio_config("true", &[], None));
        manager.inject_client("b", b, stdio_config("true", &[], None));

        let all = manager.get_tools(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all
            .iter()
            .any(|(server, tool)| server.as_str() == "b" && tool.name == "gamma"));

        let only_a = manager.get_tools(Some(&["a"])).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].1.name, "alpha");
    }

    #[tokio::test]
    async fn elicitation_handler_requires_known_server_and_routes_requests() {
        let manager = ClientConnectionManager::empty();
        let err = manager
            .set_elicitation_handler(
                "ghost",
                Arc::new(|_: Value| async { Ok::<_, String>(Value::Null) }.boxed()),
            )
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));

        let (client, fake) = fake_client("files", TransportKind::Stdio);
        manager.inject_client("files", client, stdio_config("true", &[], None));
        manager
            .set_elicitation_handler(
                "files",
                Arc::new(|params: Value| {
                    async move {
                        assert_eq!(params["message"], "which suite?");
                        Ok::<_, String>(
                            serde_json::json!({ "action": "accept", "content": { "suite": "smoke" } }),
                        )
                    }
                    .boxed()
                }),
            )
            .unwrap();

        fake.inject(IncomingMessage::Request(JsonRpcRequest::new(
            "e-1",
            methods::ELICITATION_CREATE,
            Some(serde_json::json!({ "message": "which suite?" })),
        )));
        let reply = fake.wait_for_response().await;
        assert_eq!(reply.result.unwrap()["content"]["suite"], "smoke");

        // Clearing the handler makes the client refuse further requests.
        manager.clear_elicitation_handler("files").unwrap();
        fake.inject(IncomingMessage::Request(JsonRpcRequest::new(
            "e-2",
            methods::ELICITATION_CREATE,
            Some(serde_json::json!({ "message": "again?" })),
        )));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let refused = loop {
            let responses: Vec<_> = fake
                .sent()
                .iter()
                .filter_map(|m| match m {
                    OutgoingMessage::Response(r) => Some(r.clone()),
                    _ => None,
                })
                .collect();
            if responses.len() >= 2 {
                break responses[1].clone();
            }
            assert!(tokio::time::Instant::now() < deadline, "no refusal sent");
            tokio::task::yield_now().await;
        };
        assert!(refused.error.is_some());
    }

    #[tokio::test]
    async fn initial_connects_are_asynchronous() {
        let mut servers = HashMap::new();
        servers.insert(
            "startup".to_string(),
            stdio_config("/nonexistent/not-a-command", &[], None),
        );
        let manager =
            ClientConnectionManager::new(McpConfig { servers }, ManagerOptions::default());

        // Construction does not block on the connect attempt.
        assert!(manager.get_client("startup").is_none());

        // The attempt eventually registers the name (and fails).
        let name = ServerName::new("startup").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !manager.inner.registry.lock().contains_key(&name) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "initial connect task never ran"
            );
            tokio::task::yield_now().await;
        }
        assert!(!manager.has_server("startup"));
    }

    #[test]
    fn streamable_preference_rules() {
        // Explicit flag wins in both directions.
        assert!(!prefers_streamable(&http_config("http://h/mcp", Some(true))));
        assert!(prefers_streamable(&http_config("http://h/sse", Some(false))));
        // Otherwise inferred from the URL path suffix.
        assert!(!prefers_streamable(&http_config("http://h/sse", None)));
        assert!(!prefers_streamable(&http_config("http://h/api/sse", None)));
        assert!(prefers_streamable(&http_config("http://h/mcp", None)));
        assert!(prefers_streamable(&http_config("http://h/ssend", None)));
    }
}
