// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Protocol version preference advertised at connect time.
///
/// `V1` advertises `["1", "pre2"]`; `Pre2` advertises `["pre2", "pre1"]`
/// for servers that never learned version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    V1,
    Pre2,
}

impl ProtocolVersion {
    /// The version named in the `connect` frame.
    pub fn version(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::Pre2 => "pre2",
        }
    }

    /// The fallback list advertised in the `connect` frame.
    pub fn support(self) -> &'static [&'static str] {
        match self {
            Self::V1 => &["1", "pre2"],
            Self::Pre2 => &["pre2", "pre1"],
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `wss://example.com/websocket`.
    pub url: String,
    /// Protocol version preference.
    pub version: ProtocolVersion,
    /// Client-initiated keepalive ping interval. `None` (the default)
    /// disables client pings; server pings are always answered.
    pub keepalive: Option<Duration>,
    /// Debounce window coalescing offline persists of one collection.
    pub persist_debounce: Duration,
    /// Directory for offline collection cache files.
    pub cache_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: ProtocolVersion::default(),
            keepalive: None,
            persist_debounce: Duration::from_secs(5),
            cache_dir: default_cache_dir(),
        }
    }
}

/// Resolve the default directory for offline cache files.
///
/// Checks `DDP_CACHE_DIR`, then `$XDG_CACHE_HOME/ddp-client`,
/// then `$HOME/.cache/ddp-client`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DDP_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("ddp-client");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache/ddp-client");
    }
    PathBuf::from(".ddp-client")
}
