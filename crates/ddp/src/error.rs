// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde_json::Value;

/// Errors surfaced by the DDP client.
#[derive(Debug, Clone, PartialEq)]
pub enum DdpError {
    /// The underlying WebSocket errored or closed uncleanly. Internal:
    /// feeds the reconnect policy, never a method callback.
    TransportFailed(String),
    /// The operation required a `Connected` session; nothing was sent.
    NotConnected,
    /// The method was still in flight when the connection dropped.
    /// Reported exactly once per outstanding method.
    DisconnectedBeforeCallbackComplete,
    /// Logon or signup was refused: an auth flow was already in flight,
    /// the server rejected the credentials, or the OAuth credential token
    /// did not validate.
    LogonRejected(String),
    /// The `result` frame carried a server error.
    ServerMethodError {
        /// Server-supplied `errorType` (usually `"Meteor.Error"`).
        error_type: String,
        /// Numeric server error code, when the server sent one.
        code: Option<i64>,
        message: String,
    },
    /// A collection codec rejected an incoming document. The raw document
    /// was stored instead and the stream continued.
    DecodeFailed(String),
}

impl DdpError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportFailed(_) => "TRANSPORT_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::DisconnectedBeforeCallbackComplete => "DISCONNECTED_BEFORE_CALLBACK_COMPLETE",
            Self::LogonRejected(_) => "LOGON_REJECTED",
            Self::ServerMethodError { .. } => "SERVER_METHOD_ERROR",
            Self::DecodeFailed(_) => "DECODE_FAILED",
        }
    }

    /// Build a [`DdpError::ServerMethodError`] from the `error` value of a
    /// `result` frame.
    ///
    /// Meteor error objects look like `{error: 404 | "not-found", reason,
    /// message, errorType}`; string codes map to `code: None`.
    pub fn from_server_error(error: &Value) -> Self {
        let error_type = error
            .get("errorType")
            .and_then(Value::as_str)
            .unwrap_or("Meteor.Error")
            .to_owned();
        let code = error.get("error").and_then(Value::as_i64);
        let message = error
            .get("message")
            .or_else(|| error.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        Self::ServerMethodError { error_type, code, message }
    }
}

impl fmt::Display for DdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFailed(detail) => write!(f, "transport failed: {detail}"),
            Self::NotConnected => f.write_str("not connected"),
            Self::DisconnectedBeforeCallbackComplete => {
                f.write_str("disconnected before callback completed")
            }
            Self::LogonRejected(reason) => write!(f, "logon rejected: {reason}"),
            Self::ServerMethodError { error_type, code, message } => match code {
                Some(code) => write!(f, "{error_type} ({code}): {message}"),
                None => write!(f, "{error_type}: {message}"),
            },
            Self::DecodeFailed(detail) => write!(f, "document decode failed: {detail}"),
        }
    }
}

impl std::error::Error for DdpError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
