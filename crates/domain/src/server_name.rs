//! Server name newtype.
//!
//! A [`ServerName`] uniquely identifies a logical MCP server within the
//! connection manager and is used as the registry key everywhere. The
//! constructor normalizes (trims) the raw string so `" files "` and
//! `"files"` address the same server.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// The raw name was empty (or whitespace-only) after trimming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server name must be a non-empty string")]
pub struct InvalidServerName;

/// A non-empty, trimmed identifier for a logical MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerName(String);

impl ServerName {
    /// Build a server name from a raw string, trimming surrounding
    /// whitespace. Empty results are a configuration error.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidServerName> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(InvalidServerName);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ServerName {
    type Err = InvalidServerName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ServerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ServerName::new(&raw).map_err(serde::de::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
