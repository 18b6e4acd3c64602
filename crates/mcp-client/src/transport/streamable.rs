//! Modern streamable HTTP transport.
//!
//! Every outbound message is POSTed to the server URL. The response body
//! is either a single JSON-RPC message, an SSE stream of messages (e.g. a
//! tool-call response with interleaved server requests), or empty (for
//! notifications and responses). The server assigns a session id on
//! `initialize` via the `mcp-session-id` response header; the client
//! echoes it on every subsequent request. A standalone GET stream carries
//! server-initiated traffic outside any request, retried with exponential
//! backoff per the configured reconnect policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use eb_domain::{HttpServerConfig, ReconnectPolicy};

use super::eventstream::drain_events;
use super::{IncomingTx, Transport, TransportError, TransportKind};
use crate::protocol::{methods, IncomingMessage, OutgoingMessage};

/// Header carrying the streamable-HTTP session id.
const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    http: reqwest::Client,
    url: Url,
    headers: HashMap<String, String>,
    session_id: parking_lot::RwLock<Option<String>>,
    incoming: IncomingTx,
    reconnect: ReconnectPolicy,
    alive: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    listener_started: AtomicBool,
    /// Back-reference for spawning the listener from `&self` methods.
    weak: std::sync::Weak<Self>,
}

impl std::fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("url", &self.url)
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl StreamableHttpTransport {
    /// Build the transport. No network traffic happens here: the first
    /// POST (the `initialize` handshake) is what proves the server speaks
    /// this sub-protocol, so an unsupported server fails fast there.
    pub fn connect(
        config: &HttpServerConfig,
        incoming: IncomingTx,
    ) -> Result<Arc<Self>, TransportError> {
        let url: Url = config
            .url
            .parse()
            .map_err(|e| TransportError::Protocol(format!("invalid URL {}: {e}", config.url)))?;

        Ok(Arc::new_cyclic(|weak| Self {
            http: reqwest::Client::new(),
            url,
            headers: config.headers.clone(),
            session_id: parking_lot::RwLock::new(config.session_id.clone()),
            incoming,
            reconnect: config.reconnect.clone(),
            alive: Arc::new(AtomicBool::new(true)),
            listener: Mutex::new(None),
            listener_started: AtomicBool::new(false),
            weak: weak.clone(),
        }))
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    /// Route one response body into the incoming channel.
    async fn consume_response(&self, response: reqwest::Response) -> Result<(), TransportError> {
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session.to_string());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Drain the per-request stream in the background so `send`
            // returns as soon as the POST is accepted; the requester is
            // already waiting on its pending-response slot.
            let incoming = self.incoming.clone();
            tokio::spawn(async move {
                pump_event_stream(response, incoming).await;
            });
        } else if content_type.starts_with("application/json") {
            let body = response.bytes().await?;
            match serde_json::from_slice(&body).and_then(IncomingMessage::from_value) {
                Ok(msg) => {
                    let _ = self.incoming.send(msg);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "failed to parse streamable HTTP response body");
                }
            }
        }
        // Empty bodies (202/204 for notifications and responses) need no routing.

        Ok(())
    }

    /// Open the standalone GET stream for server-initiated messages.
    async fn open_listen_stream(&self) -> Result<reqwest::Response, TransportError> {
        let request = self
            .apply_headers(self.http.get(self.url.clone()))
            .header(ACCEPT, "text/event-stream");
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(response)
    }

    fn start_listener(self: &Arc<Self>) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            transport.listen_loop().await;
        });
        // The listener slot is only contended at close time; try_lock keeps
        // this path synchronous.
        if let Ok(mut slot) = self.listener.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn listen_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            if !self.alive.load(Ordering::SeqCst) {
                return;
            }
            match self.open_listen_stream().await {
                Ok(response) => {
                    attempt = 0;
                    pump_event_stream(response, self.incoming.clone()).await;
                    if self.incoming.is_closed() {
                        return;
                    }
                    tracing::debug!("standalone listen stream ended, reconnecting");
                }
                Err(TransportError::HttpStatus(status))
                    if status == StatusCode::METHOD_NOT_ALLOWED
                        || status == StatusCode::NOT_FOUND =>
                {
                    tracing::debug!("server does not offer a standalone listen stream");
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "standalone listen stream failed");
                }
            }
            if attempt >= self.reconnect.max_retries {
                tracing::debug!("standalone listen stream retries exhausted");
                return;
            }
            tokio::time::sleep(self.reconnect.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Parse SSE `message` events off a response body into the channel.
async fn pump_event_stream(mut response: reqwest::Response, incoming: IncomingTx) {
    let mut buffer = String::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for event in drain_events(&mut buffer) {
                    match IncomingMessage::from_str(&event.data) {
                        Ok(msg) => {
                            if incoming.send(msg).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to parse streamed message");
                        }
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "streamable HTTP stream error");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let is_initialize = message.method() == Some(methods::INITIALIZE);
        let json = serde_json::to_string(&message)?;

        let request = self
            .apply_headers(self.http.post(self.url.clone()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(json);

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        self.consume_response(response).await?;

        // Once the handshake request is through, open the server-push
        // channel. (Safe to call repeatedly; only the first call spawns.)
        if is_initialize {
            if let Some(this) = self.weak.upgrade() {
                this.start_listener();
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        // Tell the server the session is over. Best-effort.
        if self.session_id.read().is_some() {
            let request = self.apply_headers(self.http.delete(self.url.clone()));
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, "failed to delete streamable HTTP session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn http_config(url: &str) -> HttpServerConfig {
        HttpServerConfig {
            url: url.into(),
            prefer_sse: None,
            headers: Default::default(),
            session_id: None,
            reconnect: Default::default(),
            common: Default::default(),
        }
    }

    #[tokio::test]
    async fn session_id_seeds_from_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = http_config("http://localhost:9999/mcp");
        config.session_id = Some("resume-me".into());
        let transport = StreamableHttpTransport::connect(&config, tx).unwrap();
        assert_eq!(transport.session_id(), Some("resume-me".into()));
        assert_eq!(transport.kind(), TransportKind::StreamableHttp);
    }

    #[tokio::test]
    async fn invalid_url_is_a_protocol_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = http_config("not a url");
        let err = StreamableHttpTransport::connect(&config, tx).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
