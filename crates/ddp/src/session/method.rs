// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outstanding method bookkeeping.
//!
//! Every registered method id reaches exactly one terminal state per
//! session: completed by a `result` frame, or failed wholesale when the
//! connection drops.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::DdpError;

/// Callback for a method's terminal state. Success carries the whole
/// `result` frame as a JSON object (`frame["result"]` holds the value).
pub type MethodCallback = Box<dyn FnOnce(Result<Value, DdpError>) + Send>;

/// Outstanding calls keyed by method id.
#[derive(Default)]
pub(crate) struct MethodTable {
    outstanding: HashMap<String, Option<MethodCallback>>,
    /// Ids not yet listed by an `updated` frame. Advisory bookkeeping
    /// only; nothing user-visible hangs off it.
    awaiting_update: HashSet<String>,
}

impl MethodTable {
    pub fn register(&mut self, id: String, callback: Option<MethodCallback>) {
        self.awaiting_update.insert(id.clone());
        self.outstanding.insert(id, callback);
    }

    /// Route a `result` frame. Returns `None` for an unknown id; otherwise
    /// the (possibly absent) callback with its outcome, to be invoked by
    /// the caller outside any lock.
    pub fn complete(
        &mut self,
        id: &str,
        frame: Value,
        error: Option<&Value>,
    ) -> Option<(Option<MethodCallback>, Result<Value, DdpError>)> {
        let callback = self.outstanding.remove(id)?;
        let outcome = match error {
            Some(error) => Err(DdpError::from_server_error(error)),
            None => Ok(frame),
        };
        Some((callback, outcome))
    }

    /// Note ids whose data effects are now visible in the store.
    pub fn mark_updated(&mut self, ids: &[String]) {
        for id in ids {
            self.awaiting_update.remove(id);
        }
    }

    /// Atomically drain every outstanding callback for disconnect
    /// invalidation. The table is empty afterwards.
    pub fn drain_disconnected(&mut self) -> Vec<MethodCallback> {
        self.awaiting_update.clear();
        self.outstanding.drain().filter_map(|(_, callback)| callback).collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn pending_update_count(&self) -> usize {
        self.awaiting_update.len()
    }
}

#[cfg(test)]
#[path = "method_tests.rs"]
mod tests;
