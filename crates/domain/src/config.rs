//! MCP connection configuration types.
//!
//! A [`ServerConfig`] describes how to reach one MCP server. It is a tagged
//! union discriminated by field presence: a `command` field means a local
//! subprocess speaking newline-delimited JSON-RPC over stdio, a `url` field
//! means a remote HTTP server (modern streamable HTTP, with a legacy SSE
//! fallback). This matches the shape of the JSON users paste into the
//! dashboard's connection settings.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level MCP configuration: logical server name -> connection config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Server definitions keyed by logical server name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Configuration for a single MCP server connection.
///
/// Untagged: variants are tried in order, so a config carrying a `command`
/// field deserializes as [`ServerConfig::Stdio`] even if it also carries
/// stray HTTP fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerConfig {
    Stdio(StdioServerConfig),
    Http(HttpServerConfig),
}

impl ServerConfig {
    /// Per-server request timeout override, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.common().timeout_ms.map(Duration::from_millis)
    }

    /// Per-server protocol version override, if configured.
    pub fn protocol_version(&self) -> Option<&str> {
        self.common().protocol_version.as_deref()
    }

    /// Per-server declared capabilities, if configured.
    pub fn capabilities(&self) -> Option<&Value> {
        self.common().capabilities.as_ref()
    }

    fn common(&self) -> &CommonServerConfig {
        match self {
            ServerConfig::Stdio(c) => &c.common,
            ServerConfig::Http(c) => &c.common,
        }
    }
}

/// Spawn a local child process and speak the protocol over its stdio pipes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioServerConfig {
    /// The command to spawn (e.g. `"npx"`).
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables set on the spawned process, merged over (and
    /// overriding) the inherited process environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(flatten)]
    pub common: CommonServerConfig,
}

/// Connect to a remote MCP server over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Target URL.
    pub url: String,

    /// Force the legacy SSE sub-protocol instead of streamable HTTP.
    /// When absent, the preference is inferred from the URL path.
    #[serde(default)]
    pub prefer_sse: Option<bool>,

    /// Extra request headers sent on every HTTP call. Authentication is
    /// carried here as an `Authorization` header.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Existing streamable-HTTP session to resume, if any.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Retry policy for the streamable transport's standalone listen stream.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(flatten)]
    pub common: CommonServerConfig,
}

/// Fields shared by both config variants.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommonServerConfig {
    /// Protocol version to advertise during the handshake.
    #[serde(default)]
    pub protocol_version: Option<String>,

    /// Capabilities to declare during the handshake, merged over the
    /// manager defaults.
    #[serde(default)]
    pub capabilities: Option<Value>,

    /// Request timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Exponential-backoff bounds for transport-internal stream reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given retry attempt (0-based), doubling each time
    /// and capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << attempt.min(10));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Protocol version advertised when neither the manager options nor the
/// per-server config override it.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Request timeout applied when neither the caller nor the server config
/// overrides it.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Manager-wide defaults, overridable per server and per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Default protocol version for the handshake.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Default declared capabilities.
    #[serde(default)]
    pub capabilities: Option<Value>,

    /// Default request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            capabilities: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ManagerOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_selects_stdio_variant() {
        let raw = r#"{
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
            "env": { "NODE_ENV": "production" }
        }"#;
        let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
        match cfg {
            ServerConfig::Stdio(c) => {
                assert_eq!(c.command, "npx");
                assert_eq!(c.args.len(), 3);
                assert_eq!(c.env.get("NODE_ENV").unwrap(), "production");
            }
            ServerConfig::Http(_) => panic!("expected stdio variant"),
        }
    }

    #[test]
    fn url_field_selects_http_variant() {
        let raw = r#"{ "url": "http://localhost:8080/mcp" }"#;
        let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
        match cfg {
            ServerConfig::Http(c) => {
                assert_eq!(c.url, "http://localhost:8080/mcp");
                assert_eq!(c.prefer_sse, None);
                assert!(c.headers.is_empty());
            }
            ServerConfig::Stdio(_) => panic!("expected http variant"),
        }
    }

    #[test]
    fn command_wins_when_both_fields_present() {
        let raw = r#"{ "command": "node", "url": "http://ignored" }"#;
        let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
        assert!(matches!(cfg, ServerConfig::Stdio(_)));
    }

    #[test]
    fn common_fields_flatten_into_both_variants() {
        let raw = r#"{ "command": "node", "timeout_ms": 5000, "protocol_version": "2024-11-05" }"#;
        let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(cfg.protocol_version(), Some("2024-11-05"));
    }

    #[test]
    fn http_config_with_auth_headers() {
        let raw = r#"{
            "url": "https://mcp.example.com/",
            "headers": { "Authorization": "Bearer token123" },
            "session_id": "abc",
            "prefer_sse": true
        }"#;
        let cfg: ServerConfig = serde_json::from_str(raw).unwrap();
        match cfg {
            ServerConfig::Http(c) => {
                assert_eq!(c.headers.get("Authorization").unwrap(), "Bearer token123");
                assert_eq!(c.session_id.as_deref(), Some("abc"));
                assert_eq!(c.prefer_sse, Some(true));
            }
            ServerConfig::Stdio(_) => panic!("expected http variant"),
        }
    }

    #[test]
    fn empty_mcp_config() {
        let cfg: McpConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn mcp_config_keyed_by_name() {
        let raw = r#"{ "servers": { "files": { "command": "mcp-files" } } }"#;
        let cfg: McpConfig = serde_json::from_str(raw).unwrap();
        assert!(cfg.servers.contains_key("files"));
    }

    #[test]
    fn reconnect_policy_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for_attempt(1) > policy.delay_for_attempt(0));
        assert!(policy.delay_for_attempt(100) <= Duration::from_millis(policy.max_delay_ms));
    }

    #[test]
    fn manager_options_defaults() {
        let opts = ManagerOptions::default();
        assert_eq!(opts.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(opts.request_timeout(), Duration::from_millis(30_000));
    }
}
