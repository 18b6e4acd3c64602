//! Legacy HTTP+SSE transport.
//!
//! The client GETs the configured URL and holds the response open as an
//! SSE stream. The server's first `endpoint` event announces the URL to
//! POST outbound messages to (resolved relative to the base URL); every
//! later `message` event carries an inbound JSON-RPC message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use eb_domain::HttpServerConfig;

use super::eventstream::{drain_events, DEFAULT_EVENT};
use super::{IncomingTx, Transport, TransportError, TransportKind};
use crate::protocol::{IncomingMessage, OutgoingMessage};

/// Event name announcing the POST endpoint on the SSE stream.
const ENDPOINT_EVENT: &str = "endpoint";

pub struct SseTransport {
    http: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the SSE stream and wait for the server to announce its POST
    /// endpoint. The caller bounds this with the connect timeout.
    pub async fn connect(
        config: &HttpServerConfig,
        incoming: IncomingTx,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::new();
        let base: Url = config
            .url
            .parse()
            .map_err(|e| TransportError::Protocol(format!("invalid URL {}: {e}", config.url)))?;

        let mut request = http.get(base.clone()).header(ACCEPT, "text/event-stream");
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        let mut response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }

        // Read until the endpoint event arrives; forward any interleaved
        // messages so nothing is lost.
        let mut buffer = String::new();
        let endpoint = loop {
            match response.chunk().await? {
                Some(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    let mut announced: Option<Url> = None;
                    for event in drain_events(&mut buffer) {
                        if event.event == ENDPOINT_EVENT && announced.is_none() {
                            announced = Some(resolve_endpoint(&base, &event.data)?);
                        } else if event.event == DEFAULT_EVENT {
                            forward(&incoming, &event.data);
                        }
                    }
                    if let Some(endpoint) = announced {
                        break endpoint;
                    }
                }
                None => {
                    return Err(TransportError::Protocol(
                        "SSE stream ended before announcing an endpoint".into(),
                    ));
                }
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let reader = {
            let alive = alive.clone();
            tokio::spawn(async move {
                read_stream(response, buffer, incoming).await;
                alive.store(false, Ordering::SeqCst);
            })
        };

        tracing::debug!(endpoint = %endpoint, "SSE transport connected");

        Ok(Self {
            http,
            endpoint,
            headers: config.headers.clone(),
            alive,
            reader: Mutex::new(Some(reader)),
        })
    }
}

/// Resolve the announced endpoint (often a relative path with a session
/// query) against the stream's base URL.
fn resolve_endpoint(base: &Url, raw: &str) -> Result<Url, TransportError> {
    base.join(raw.trim())
        .map_err(|e| TransportError::Protocol(format!("invalid SSE endpoint {raw:?}: {e}")))
}

fn forward(incoming: &IncomingTx, data: &str) -> bool {
    match IncomingMessage::from_str(data) {
        Ok(msg) => incoming.send(msg).is_ok(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse SSE message");
            true
        }
    }
}

/// Pump the long-lived SSE stream into the incoming channel until the
/// stream ends or the receiver goes away.
async fn read_stream(mut response: reqwest::Response, mut buffer: String, incoming: IncomingTx) {
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for event in drain_events(&mut buffer) {
                    if event.event == DEFAULT_EVENT && !forward(&incoming, &event.data) {
                        return;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("SSE stream closed by server");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "SSE stream error");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let json = serde_json::to_string(&message)?;
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(json);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
