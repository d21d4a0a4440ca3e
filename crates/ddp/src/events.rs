// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection-lifecycle events and the broadcast hub that fans them out to
//! host subscribers. Per-document change events travel through watcher
//! callbacks instead (see [`crate::store::dispatch`]).

use tokio::sync::broadcast;

/// Lifecycle notifications delivered via [`Client::events`](crate::Client::events).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server acknowledged the session (`connected` frame).
    Connected,
    /// Post-connect work finished: the resume login completed, or there
    /// was no stored token to resume.
    Ready,
    /// The transport dropped. Outstanding method callbacks have already
    /// been failed by the time this is observed.
    Disconnected,
    /// The authenticated user changed (login, resume, logout).
    SessionUpdate {
        /// The current user id; `None` after logout.
        user_id: Option<String>,
    },
}

/// Hub fanning lifecycle events out to subscribers.
pub struct EventHub {
    event_tx: broadcast::Sender<ClientEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self { event_tx }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Emit an event. Lagging or absent subscribers are not an error.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
