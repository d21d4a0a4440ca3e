// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! DDP wire frames.
//!
//! Every frame is a JSON text message discriminated by `msg`. Outgoing
//! `params` arrays are run through the EJSON walker at construction time,
//! so a built [`ClientMessage`] is always wire-ready.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ejson;

/// Client → server frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect {
        version: String,
        support: Vec<String>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
    Unsub {
        id: String,
    },
    Method {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
}

impl ClientMessage {
    /// Build the version-negotiation frame.
    pub fn connect(version: &str, support: &[&str]) -> Self {
        Self::Connect {
            version: version.to_owned(),
            support: support.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Build a `sub` frame; `params` go through the EJSON walker.
    pub fn sub(id: String, name: String, params: Vec<Value>) -> Self {
        let params = if params.is_empty() { None } else { Some(ejson::encode_params(params)) };
        Self::Sub { id, name, params }
    }

    /// Build a `method` frame; `params` go through the EJSON walker.
    pub fn method(id: String, method: String, params: Vec<Value>) -> Self {
        let params = if params.is_empty() { None } else { Some(ejson::encode_params(params)) };
        Self::Method { id, method, params }
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client frames.
///
/// `fields` and `cleared` default to empty so sparse frames parse without
/// special cases.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
    Pong {
        #[serde(default)]
        id: Option<String>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default)]
        before: Option<String>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default)]
        cleared: Vec<String>,
    },
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default)]
        error: Option<Value>,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Updated {
        methods: Vec<String>,
    },
    Error {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default, rename = "offendingMessage")]
        offending_message: Option<Value>,
    },
}

/// Parse one incoming text frame.
///
/// Malformed JSON and unknown `msg` values yield `None`; the session drops
/// them without error.
pub fn decode_frame(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(err = %e, "dropping unrecognized frame");
            None
        }
    }
}

// -- Id generation -------------------------------------------------------------

/// Monotonic string id source shared by subscriptions, methods, and pings.
#[derive(Debug)]
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Charset for generated document ids. Meteor's "unmistakable" alphabet:
/// no `0/O`, `1/I/l`, or `u/U/V`.
const ID_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// Generate a random 17-character document id.
pub fn random_document_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..17)
        .map(|_| {
            let i = rng.random_range(0..ID_CHARS.len());
            char::from(ID_CHARS[i])
        })
        .collect()
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
