// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public client handle.
//!
//! A [`Client`] is a cheap-to-clone handle onto one session loop.
//! Command-style methods are synchronous sends onto the loop's queue;
//! snapshot reads go through the shared store lock and are async. The
//! loop shuts down when [`shutdown`](Client::shutdown) is called or every
//! handle has been dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::auth::{self, AuthState, LoginCallback, LoginSession, UserIdent};
use crate::config::ClientConfig;
use crate::error::DdpError;
use crate::events::ClientEvent;
use crate::session::method::MethodCallback;
use crate::session::subscription::{GroupReadyCallback, ReadyCallback};
use crate::session::{Command, Session, SessionState, Shared, SubSpec};
use crate::store::codec::{DocumentCodec, SerdeCodec, TypedDocument};
use crate::store::dispatch::{WatchCallback, WatchPredicate, WatcherId};
use crate::store::{Document, StoredValue};

/// Handle to a DDP client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    cmd_tx: UnboundedSender<Command>,
    http: reqwest::Client,
}

impl Client {
    /// Create a client and spawn its session loop. The connection is not
    /// opened until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(config));
        let session = Session::new(Arc::clone(&shared), cmd_rx);
        tokio::spawn(session.run());
        Self {
            shared,
            cmd_tx,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    // -- Connection lifecycle -------------------------------------------------

    /// Open (or re-open) the connection. Connecting while already
    /// connected tears the session down and renegotiates.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the connection without scheduling a reconnect.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session_state()
    }

    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.auth_state()
    }

    /// Subscribe to connection-lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the session loop and release the transport.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    // -- Collections ----------------------------------------------------------

    /// Register a codec for a collection. Documents already stored raw
    /// are not retroactively converted.
    pub async fn register_codec(&self, collection: &str, codec: Arc<dyn DocumentCodec>) {
        self.shared.store.write().await.register_codec(collection, codec);
    }

    /// Register a serde-backed codec for `T`.
    pub async fn register_type<T>(&self, collection: &str)
    where
        T: TypedDocument + serde::Serialize + serde::de::DeserializeOwned,
    {
        self.register_codec(collection, Arc::new(SerdeCodec::<T>::new())).await;
    }

    /// Ordered snapshot of a collection's values.
    pub async fn documents(&self, collection: &str) -> Vec<StoredValue> {
        self.shared.store.read().await.snapshot(collection)
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<StoredValue> {
        self.shared.store.read().await.document(collection, id)
    }

    /// Values passing a caller-supplied predicate, in collection order.
    pub async fn find(
        &self,
        collection: &str,
        predicate: impl Fn(&StoredValue) -> bool,
    ) -> Vec<StoredValue> {
        self.shared.store.read().await.find(collection, predicate)
    }

    /// Optimistic insert: the value lands in the local store immediately
    /// (with a generated `_id` if the document lacks one) and the server
    /// echoes an authoritative `added` for the same id later.
    pub fn insert(
        &self,
        collection: &str,
        value: impl Into<StoredValue>,
        callback: Option<MethodCallback>,
    ) {
        self.send(Command::Insert {
            collection: collection.to_owned(),
            value: value.into(),
            callback,
        });
    }

    /// Send a `{$set, $unset}` update built from `changes`; a null value
    /// marks the field for `$unset`. No local mutation is performed — the
    /// server echoes a `changed`.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        changes: Document,
        callback: Option<MethodCallback>,
    ) {
        self.send(Command::Update {
            collection: collection.to_owned(),
            id: id.to_owned(),
            changes,
            callback,
        });
    }

    /// Optimistic remove: drops the local entry, then RPCs the server.
    pub fn remove(&self, collection: &str, id: &str, callback: Option<MethodCallback>) {
        self.send(Command::Remove {
            collection: collection.to_owned(),
            id: id.to_owned(),
            callback,
        });
    }

    // -- Subscriptions --------------------------------------------------------

    /// Subscribe to a named publication. The subscription is recorded
    /// immediately and replayed after every reconnect; `on_ready` fires on
    /// each `ready` listing it.
    pub fn subscribe(
        &self,
        name: &str,
        params: Vec<Value>,
        on_ready: Option<ReadyCallback>,
    ) -> String {
        let id = self.shared.ids.next_id();
        self.send(Command::Subscribe {
            id: id.clone(),
            name: name.to_owned(),
            params,
            on_ready,
        });
        id
    }

    /// Subscribe to several publications as a group whose `on_ready`
    /// fires exactly once, when every member is ready. Returns the group
    /// id, usable with [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_many(
        &self,
        specs: Vec<(String, Vec<Value>)>,
        on_ready: Option<GroupReadyCallback>,
    ) -> String {
        let group_id = self.shared.ids.next_id();
        let members = specs
            .into_iter()
            .map(|(name, params)| SubSpec { id: self.shared.ids.next_id(), name, params })
            .collect();
        self.send(Command::SubscribeMany { group_id: group_id.clone(), members, on_ready });
        group_id
    }

    /// Unsubscribe a subscription or a whole group. A no-op while
    /// disconnected.
    pub fn unsubscribe(&self, id: &str) {
        self.send(Command::Unsubscribe { id: id.to_owned() });
    }

    // -- Methods --------------------------------------------------------------

    /// Invoke a server method. Requires a `Connected` session: otherwise
    /// the callback fires synchronously with `NotConnected` and no id is
    /// allocated. On success the callback receives the whole `result`
    /// frame (`frame["result"]` holds the value).
    pub fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Option<String> {
        if self.session_state() != SessionState::Connected {
            if let Some(callback) = callback {
                callback(Err(DdpError::NotConnected));
            }
            return None;
        }
        let id = self.shared.ids.next_id();
        self.send(Command::Call {
            id: id.clone(),
            method: method.to_owned(),
            params,
            callback,
        });
        Some(id)
    }

    // -- Watchers -------------------------------------------------------------

    /// Watch a single document by id.
    pub fn watch_document(&self, collection: &str, id: &str, callback: WatchCallback) -> WatcherId {
        let watcher = self.shared.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.send(Command::WatchDocument {
            watcher,
            collection: collection.to_owned(),
            target: id.to_owned(),
            callback,
        });
        watcher
    }

    /// Watch a collection, optionally filtered by a predicate over the
    /// post-operation value. Removals always fire, without a value.
    pub fn watch_collection(
        &self,
        collection: &str,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    ) -> WatcherId {
        let watcher = self.shared.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.send(Command::WatchCollection {
            watcher,
            collection: collection.to_owned(),
            predicate,
            callback,
        });
        watcher
    }

    pub fn unwatch(&self, watcher: WatcherId) {
        self.send(Command::Unwatch { watcher });
    }

    // -- Auth -----------------------------------------------------------------

    pub fn login_with_username(
        &self,
        username: &str,
        password: &str,
        callback: Option<LoginCallback>,
    ) {
        let params = auth::password_params(&UserIdent::Username(username.to_owned()), password);
        self.send(Command::Login { method: "login".to_owned(), params, callback });
    }

    pub fn login_with_email(&self, email: &str, password: &str, callback: Option<LoginCallback>) {
        let params = auth::password_params(&UserIdent::Email(email.to_owned()), password);
        self.send(Command::Login { method: "login".to_owned(), params, callback });
    }

    /// Resume a previous session by token.
    pub fn login_with_token(&self, token: &str, callback: Option<LoginCallback>) {
        self.send(Command::Login {
            method: "login".to_owned(),
            params: auth::resume_params(token),
            callback,
        });
    }

    /// Create an account via `createUser` and log in as it.
    pub fn signup(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        password: &str,
        profile: Document,
        callback: Option<LoginCallback>,
    ) {
        let params = auth::signup_params(username, email, password, &profile);
        self.send(Command::Login { method: "createUser".to_owned(), params, callback });
    }

    /// Complete a third-party OAuth login: fetch the provider's
    /// completion page over HTTP, scrape the credential secret, then log
    /// in with it. `token` is the access token (Facebook) or
    /// authorization code (everything else) from the provider redirect.
    pub async fn login_with_oauth(
        &self,
        service: &str,
        token: &str,
        callback: Option<LoginCallback>,
    ) {
        match auth::oauth_login_params(&self.http, &self.shared.config.url, service, token).await {
            Ok(params) => {
                self.send(Command::Login { method: "login".to_owned(), params, callback });
            }
            Err(e) => {
                if let Some(callback) = callback {
                    callback(Err(e));
                }
            }
        }
    }

    /// Fire-and-forget `logout` plus a local transition to `LoggedOut`.
    pub fn logout(&self) {
        self.send(Command::Logout);
    }

    /// The current authenticated session, if any.
    pub async fn login_session(&self) -> Option<LoginSession> {
        self.shared.auth_session.read().await.clone()
    }

    // -- Offline overlay ------------------------------------------------------

    /// Queue a persist of a typed collection to its cache file. Repeated
    /// requests coalesce through a 5-second debounce; the write itself
    /// runs on a background task.
    pub fn persist_collection(&self, collection: &str) {
        self.send(Command::Persist { collection: collection.to_owned() });
    }

    /// Restore a typed collection from its cache file. Restored documents
    /// carry `_wasOffline_ = true` and survive reconnect resets until the
    /// server replaces them.
    pub fn restore_collection(&self, collection: &str) {
        self.send(Command::Restore { collection: collection.to_owned() });
    }

    /// Drop every still-cached document and delete the cache file.
    pub fn clear_offline(&self, collection: &str) {
        self.send(Command::ClearOffline { collection: collection.to_owned() });
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
