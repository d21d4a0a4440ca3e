// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watcher registration and change fan-out.
//!
//! Two tables per collection: id-watchers keyed on a target document id,
//! and predicate-watchers filtering on the post-operation value. The
//! session loop owns the dispatcher and invokes it after releasing the
//! store lock, so callbacks observe post-state and may re-enter the
//! client handle. Watcher mutations made from inside a callback are
//! reflected on subsequent events.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::store::StoredValue;

/// Why a watcher fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Added,
    AddedBefore,
    Changed,
    MovedBefore,
    Removed,
}

/// Opaque watcher handle. Lifetime is bound by register/remove only.
pub type WatcherId = u64;

/// Watcher callback: `(reason, document id, value)`.
///
/// The value is the post-operation stored value; for `Removed`,
/// id-watchers receive the prior value and predicate-watchers none.
pub type WatchCallback = Box<dyn FnMut(ChangeReason, &str, Option<&StoredValue>) + Send>;

/// Predicate deciding whether a predicate-watcher fires for a value.
pub type WatchPredicate = Box<dyn Fn(&StoredValue) -> bool + Send>;

struct IdWatcher {
    target: String,
    callback: WatchCallback,
}

struct PredicateWatcher {
    predicate: Option<WatchPredicate>,
    callback: WatchCallback,
}

/// Per-collection watcher tables, iterated in registration order.
#[derive(Default)]
pub(crate) struct Dispatcher {
    by_id: HashMap<String, IndexMap<WatcherId, IdWatcher>>,
    by_predicate: HashMap<String, IndexMap<WatcherId, PredicateWatcher>>,
}

impl Dispatcher {
    /// Register a watcher for a single document id.
    pub fn watch_document(
        &mut self,
        watcher: WatcherId,
        collection: &str,
        target: String,
        callback: WatchCallback,
    ) {
        self.by_id
            .entry(collection.to_owned())
            .or_default()
            .insert(watcher, IdWatcher { target, callback });
    }

    /// Register a collection watcher with an optional predicate.
    pub fn watch_collection(
        &mut self,
        watcher: WatcherId,
        collection: &str,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    ) {
        self.by_predicate
            .entry(collection.to_owned())
            .or_default()
            .insert(watcher, PredicateWatcher { predicate, callback });
    }

    /// Remove a watcher from whichever table holds it.
    pub fn remove(&mut self, watcher: WatcherId) {
        for table in self.by_id.values_mut() {
            if table.shift_remove(&watcher).is_some() {
                return;
            }
        }
        for table in self.by_predicate.values_mut() {
            if table.shift_remove(&watcher).is_some() {
                return;
            }
        }
    }

    /// Fan one store change out to qualifying watchers: id-watchers first,
    /// then predicate-watchers, each in registration order.
    pub fn dispatch(
        &mut self,
        collection: &str,
        reason: ChangeReason,
        doc_id: &str,
        value: Option<&StoredValue>,
    ) {
        if let Some(table) = self.by_id.get_mut(collection) {
            for watcher in table.values_mut() {
                if watcher.target == doc_id {
                    (watcher.callback)(reason, doc_id, value);
                }
            }
        }
        if let Some(table) = self.by_predicate.get_mut(collection) {
            for watcher in table.values_mut() {
                if reason == ChangeReason::Removed {
                    // Removals fire unconditionally and carry no value:
                    // there is nothing left to run the predicate against.
                    (watcher.callback)(reason, doc_id, None);
                    continue;
                }
                let passes = match (&watcher.predicate, value) {
                    (Some(predicate), Some(value)) => predicate(value),
                    _ => true,
                };
                if passes {
                    (watcher.callback)(reason, doc_id, value);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
