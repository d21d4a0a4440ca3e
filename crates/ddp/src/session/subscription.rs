// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription records, groups, and the replay table.
//!
//! The record table doubles as the replay source: after a reconnect every
//! recorded subscription is re-sent with its original id, so the active
//! set of names and params survives the connection cycle.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;

use crate::protocol::ClientMessage;

/// Per-subscription ready callback. Fires on every `ready` that lists the
/// subscription, including after reconnect replays.
pub type ReadyCallback = Box<dyn FnMut() + Send>;

/// Group ready callback. Fires exactly once for the group's lifetime,
/// when the last member becomes ready.
pub type GroupReadyCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct SubRecord {
    pub name: String,
    pub params: Vec<Value>,
    pub ready: bool,
    pub group: Option<String>,
    pub on_ready: Option<ReadyCallback>,
}

struct SubGroup {
    members: Vec<String>,
    fired: bool,
    on_ready: Option<GroupReadyCallback>,
}

/// Subscription state, keyed by sub id in registration order.
#[derive(Default)]
pub(crate) struct SubTable {
    subs: IndexMap<String, SubRecord>,
    groups: HashMap<String, SubGroup>,
}

impl SubTable {
    pub fn insert(
        &mut self,
        id: String,
        name: String,
        params: Vec<Value>,
        group: Option<String>,
        on_ready: Option<ReadyCallback>,
    ) {
        self.subs.insert(id, SubRecord { name, params, ready: false, group, on_ready });
    }

    pub fn insert_group(
        &mut self,
        group_id: String,
        members: Vec<String>,
        on_ready: Option<GroupReadyCallback>,
    ) {
        self.groups.insert(group_id, SubGroup { members, fired: false, on_ready });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    pub fn is_group(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.groups.get(group_id).map(|g| g.members.clone()).unwrap_or_default()
    }

    pub fn remove_sub(&mut self, id: &str) {
        self.subs.shift_remove(id);
    }

    pub fn remove_group(&mut self, group_id: &str) {
        self.groups.remove(group_id);
    }

    /// Mark the listed ids ready, invoking per-sub callbacks and firing
    /// any group whose last member just became ready.
    pub fn mark_ready(&mut self, ids: &[String]) {
        for id in ids {
            let group = match self.subs.get_mut(id) {
                Some(record) => {
                    record.ready = true;
                    if let Some(cb) = record.on_ready.as_mut() {
                        cb();
                    }
                    record.group.clone()
                }
                None => {
                    tracing::debug!(%id, "ready for unknown subscription");
                    continue;
                }
            };
            if let Some(group_id) = group {
                self.check_group(&group_id);
            }
        }
    }

    fn check_group(&mut self, group_id: &str) {
        let all_ready = {
            let Some(group) = self.groups.get(group_id) else {
                return;
            };
            if group.fired {
                return;
            }
            group.members.iter().all(|m| self.subs.get(m).is_some_and(|r| r.ready))
        };
        if !all_ready {
            return;
        }
        if let Some(group) = self.groups.get_mut(group_id) {
            group.fired = true;
            if let Some(cb) = group.on_ready.take() {
                cb();
            }
        }
    }

    /// Reset readiness and build `sub` frames for every recorded
    /// subscription, in registration order.
    pub fn replay_frames(&mut self) -> Vec<ClientMessage> {
        self.subs
            .iter_mut()
            .map(|(id, record)| {
                record.ready = false;
                ClientMessage::sub(id.clone(), record.name.clone(), record.params.clone())
            })
            .collect()
    }

    /// Active `(name, params)` pairs, in registration order.
    pub fn active(&self) -> Vec<(String, Vec<Value>)> {
        self.subs.values().map(|r| (r.name.clone(), r.params.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
