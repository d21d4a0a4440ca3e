// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session FSM and the single event loop.
//!
//! One task owns the transport, the method and subscription tables, the
//! watcher dispatcher, and the auth state, and `select!`s over transport
//! frames, handle commands, and timers (reconnect backoff, keepalive,
//! persist debounce). Store data sits behind a coarse `RwLock` shared
//! with the handle for reads; the loop is the only writer and always
//! releases the guard before invoking watcher callbacks, so callbacks
//! observe post-state and may re-enter the handle freely.

pub mod method;
pub mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthState, LoginCallback, LoginSession};
use crate::config::ClientConfig;
use crate::error::DdpError;
use crate::events::{ClientEvent, EventHub};
use crate::protocol::{self, ClientMessage, IdGen, ServerMessage};
use crate::session::method::{MethodCallback, MethodTable};
use crate::session::subscription::{GroupReadyCallback, ReadyCallback, SubTable};
use crate::store::dispatch::{Dispatcher, WatchCallback, WatchPredicate, WatcherId};
use crate::store::{offline, ChangeEvent, Document, Origin, Store, StoredValue};
use crate::transport::{Transport, TransportEvent};

/// Reconnect backoff step; the delay is `step × tries`.
const RECONNECT_STEP: Duration = Duration::from_secs(5);
/// Backoff multiplier cap (caps the delay at 30 s).
const MAX_TRIES: u32 = 6;

/// Connection state, readable synchronously from the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Transport open, `connected` frame not yet received.
    AwaitingConnected,
    Connected,
    Reconnecting,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::AwaitingConnected => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::AwaitingConnected,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

fn auth_state_as_u8(state: AuthState) -> u8 {
    match state {
        AuthState::NoAuth => 0,
        AuthState::LoggingIn => 1,
        AuthState::LoggedIn => 2,
        AuthState::LoggedOut => 3,
    }
}

fn auth_state_from_u8(raw: u8) -> AuthState {
    match raw {
        1 => AuthState::LoggingIn,
        2 => AuthState::LoggedIn,
        3 => AuthState::LoggedOut,
        _ => AuthState::NoAuth,
    }
}

/// State shared between the handle and the session loop.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub store: RwLock<Store>,
    pub auth_session: RwLock<Option<LoginSession>>,
    pub events: EventHub,
    pub ids: IdGen,
    pub next_watcher: AtomicU64,
    conn_state: AtomicU8,
    auth_state: AtomicU8,
    pub shutdown: CancellationToken,
}

impl Shared {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            store: RwLock::new(Store::new()),
            auth_session: RwLock::new(None),
            events: EventHub::new(),
            ids: IdGen::new(),
            next_watcher: AtomicU64::new(1),
            conn_state: AtomicU8::new(SessionState::Disconnected.as_u8()),
            auth_state: AtomicU8::new(auth_state_as_u8(AuthState::NoAuth)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        SessionState::from_u8(self.conn_state.load(Ordering::SeqCst))
    }

    fn set_session_state(&self, state: SessionState) {
        self.conn_state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn auth_state(&self) -> AuthState {
        auth_state_from_u8(self.auth_state.load(Ordering::SeqCst))
    }

    fn set_auth_state(&self, state: AuthState) {
        self.auth_state.store(auth_state_as_u8(state), Ordering::SeqCst);
    }
}

/// One member of a grouped subscribe.
pub(crate) struct SubSpec {
    pub id: String,
    pub name: String,
    pub params: Vec<Value>,
}

/// Commands from the handle to the loop.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe {
        id: String,
        name: String,
        params: Vec<Value>,
        on_ready: Option<ReadyCallback>,
    },
    SubscribeMany {
        group_id: String,
        members: Vec<SubSpec>,
        on_ready: Option<GroupReadyCallback>,
    },
    Unsubscribe {
        id: String,
    },
    Call {
        id: String,
        method: String,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    },
    Insert {
        collection: String,
        value: StoredValue,
        callback: Option<MethodCallback>,
    },
    Update {
        collection: String,
        id: String,
        changes: Document,
        callback: Option<MethodCallback>,
    },
    Remove {
        collection: String,
        id: String,
        callback: Option<MethodCallback>,
    },
    WatchDocument {
        watcher: WatcherId,
        collection: String,
        target: String,
        callback: WatchCallback,
    },
    WatchCollection {
        watcher: WatcherId,
        collection: String,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    },
    Unwatch {
        watcher: WatcherId,
    },
    Login {
        method: String,
        params: Value,
        callback: Option<LoginCallback>,
    },
    Logout,
    Persist {
        collection: String,
    },
    Restore {
        collection: String,
    },
    ClearOffline {
        collection: String,
    },
}

/// Why a login method was issued.
enum LoginKind {
    Explicit,
    Resume,
}

struct PendingLogin {
    method_id: String,
    kind: LoginKind,
    callback: Option<LoginCallback>,
}

/// Outcome of handling one command while a transport is up.
enum Flow {
    Continue,
    /// Tear the current transport down (disconnect or renegotiate).
    TearDown,
    /// A write failed; treat as a transport error.
    SendFailed,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    cmd_rx: UnboundedReceiver<Command>,
    dispatcher: Dispatcher,
    methods: MethodTable,
    subs: SubTable,
    tries: u32,
    disconnect_requested: bool,
    connect_requested: bool,
    reconnect_at: Option<Instant>,
    pending_login: Option<PendingLogin>,
    session_token: Option<String>,
    persist_deadlines: HashMap<String, Instant>,
}

impl Session {
    pub fn new(shared: Arc<Shared>, cmd_rx: UnboundedReceiver<Command>) -> Self {
        Self {
            shared,
            cmd_rx,
            dispatcher: Dispatcher::default(),
            methods: MethodTable::default(),
            subs: SubTable::default(),
            tries: 1,
            disconnect_requested: false,
            connect_requested: false,
            reconnect_at: None,
            pending_login: None,
            session_token: None,
            persist_deadlines: HashMap::new(),
        }
    }

    /// Drive the session until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }
            if self.connect_requested {
                self.connect_requested = false;
                self.reconnect_at = None;
                if let Some(transport) = self.try_connect().await {
                    self.connected_phase(transport).await;
                }
                continue;
            }

            let deadline = earliest(self.reconnect_at, self.next_persist_deadline());
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        let _ = self.handle_command(None, cmd).await;
                    }
                    None => break,
                },
                _ = wait_deadline(deadline) => {
                    let now = Instant::now();
                    if self.reconnect_at.is_some_and(|at| at <= now) {
                        self.reconnect_at = None;
                        self.connect_requested = true;
                    }
                    self.flush_due_persists(now).await;
                }
            }
        }
        self.shared.set_session_state(SessionState::Disconnected);
    }

    // -- Connection lifecycle -------------------------------------------------

    /// Open a transport and perform the on-open duties: send `connect`,
    /// reset the store (keeping cache entries), replay subscriptions.
    async fn try_connect(&mut self) -> Option<Transport> {
        let url = self.shared.config.url.clone();
        match Transport::connect(&url).await {
            Ok(mut transport) => {
                self.shared.set_session_state(SessionState::AwaitingConnected);
                let version = self.shared.config.version;
                let connect = ClientMessage::connect(version.version(), version.support());
                if transport.send(connect.encode()).await.is_err() {
                    self.connection_lost("send failed").await;
                    return None;
                }
                self.tries = 1;
                {
                    self.shared.store.write().await.reset_keeping_cache();
                }
                if self.replay_subscriptions(&mut transport).await.is_err() {
                    self.connection_lost("send failed").await;
                    return None;
                }
                Some(transport)
            }
            Err(e) => {
                tracing::warn!(err = %e, %url, "websocket connect failed");
                self.connection_lost("connect failed").await;
                None
            }
        }
    }

    /// Serve one live connection until it drops or is torn down.
    async fn connected_phase(&mut self, mut transport: Transport) {
        let mut next_ping = self.shared.config.keepalive.map(|d| Instant::now() + d);
        loop {
            if self.shared.shutdown.is_cancelled() {
                transport.close().await;
                return;
            }
            let timer = earliest(self.next_persist_deadline(), next_ping);
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => {
                    transport.close().await;
                    return;
                }
                event = transport.next_event() => match event {
                    TransportEvent::Text(text) => {
                        if self.handle_frame(&mut transport, &text).await.is_err() {
                            self.connection_lost("send failed").await;
                            return;
                        }
                    }
                    TransportEvent::Closed => {
                        self.connection_lost("peer closed").await;
                        return;
                    }
                    TransportEvent::Errored(err) => {
                        tracing::warn!(err = %err, "websocket error");
                        self.connection_lost(&err).await;
                        return;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => match self.handle_command(Some(&mut transport), cmd).await {
                        Flow::Continue => {}
                        Flow::TearDown => {
                            transport.close().await;
                            self.connection_lost("local teardown").await;
                            return;
                        }
                        Flow::SendFailed => {
                            self.connection_lost("send failed").await;
                            return;
                        }
                    },
                    None => {
                        // Every handle is gone; shut the loop down.
                        transport.close().await;
                        self.shared.shutdown.cancel();
                        return;
                    }
                },
                _ = wait_deadline(timer) => {
                    let now = Instant::now();
                    if next_ping.is_some_and(|at| at <= now) {
                        let ping = ClientMessage::Ping { id: Some(self.shared.ids.next_id()) };
                        if transport.send(ping.encode()).await.is_err() {
                            self.connection_lost("send failed").await;
                            return;
                        }
                        next_ping = self.shared.config.keepalive.map(|d| now + d);
                    }
                    self.flush_due_persists(now).await;
                }
            }
        }
    }

    /// Invalidate outstanding work and either rest in `Disconnected`
    /// (requested) or schedule a reconnect with linear backoff.
    async fn connection_lost(&mut self, reason: &str) {
        tracing::debug!(reason, "connection lost");
        self.shared.set_session_state(SessionState::Disconnected);

        // Every outstanding method fails before the disconnect
        // notification goes out.
        let callbacks = self.methods.drain_disconnected();
        let login = self.pending_login.take();
        for callback in callbacks {
            callback(Err(DdpError::DisconnectedBeforeCallbackComplete));
        }
        if let Some(pending) = login {
            if self.shared.auth_state() == AuthState::LoggingIn {
                self.shared.set_auth_state(AuthState::LoggedOut);
            }
            if let Some(callback) = pending.callback {
                callback(Err(DdpError::DisconnectedBeforeCallbackComplete));
            }
        }
        self.shared.events.emit(ClientEvent::Disconnected);

        if self.disconnect_requested {
            self.disconnect_requested = false;
            self.reconnect_at = None;
        } else {
            self.shared.set_session_state(SessionState::Reconnecting);
            self.reconnect_at = Some(Instant::now() + RECONNECT_STEP * self.tries);
            self.tries = (self.tries + 1).min(MAX_TRIES);
        }
    }

    async fn replay_subscriptions(&mut self, transport: &mut Transport) -> anyhow::Result<()> {
        for frame in self.subs.replay_frames() {
            transport.send(frame.encode()).await?;
        }
        Ok(())
    }

    // -- Frame handling -------------------------------------------------------

    async fn handle_frame(&mut self, transport: &mut Transport, text: &str) -> anyhow::Result<()> {
        let Some(msg) = protocol::decode_frame(text) else {
            return Ok(());
        };
        match msg {
            ServerMessage::Connected { session } => {
                tracing::debug!(%session, "session established");
                self.shared.set_session_state(SessionState::Connected);
                self.shared.events.emit(ClientEvent::Connected);
                if let Some(token) = self.session_token.clone() {
                    self.begin_login(
                        transport,
                        "login",
                        auth::resume_params(&token),
                        LoginKind::Resume,
                        None,
                    )
                    .await?;
                } else {
                    self.shared.events.emit(ClientEvent::Ready);
                }
                self.replay_subscriptions(transport).await?;
            }
            ServerMessage::Ping { id } => {
                transport.send(ClientMessage::Pong { id }.encode()).await?;
            }
            ServerMessage::Pong { .. } => {}
            ServerMessage::Added { collection, id, fields } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_added(&collection, &id, fields)
                };
                self.dispatch_event(event);
            }
            ServerMessage::AddedBefore { collection, id, fields, before } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_added_before(&collection, &id, fields, before.as_deref())
                };
                self.dispatch_event(event);
            }
            ServerMessage::Changed { collection, id, fields, cleared } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_changed(&collection, &id, fields, &cleared)
                };
                self.dispatch_event(event);
            }
            ServerMessage::MovedBefore { collection, id, before } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_moved_before(&collection, &id, before.as_deref())
                };
                if let Some(event) = event {
                    self.dispatch_event(event);
                }
            }
            ServerMessage::Removed { collection, id } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_removed(&collection, &id)
                };
                self.dispatch_event(event);
            }
            ServerMessage::Ready { subs } => {
                self.subs.mark_ready(&subs);
            }
            ServerMessage::Nosub { id, error } => {
                if let Some(error) = error {
                    tracing::warn!(%id, error = %error, "subscription ended by server");
                }
                self.subs.remove_sub(&id);
            }
            ServerMessage::Result { id, result: _, error } => {
                let frame: Value = serde_json::from_str(text).unwrap_or(Value::Null);
                self.route_result(&id, frame, error).await;
            }
            ServerMessage::Updated { methods } => {
                self.methods.mark_updated(&methods);
            }
            ServerMessage::Error { reason, offending_message } => {
                tracing::warn!(
                    reason = reason.as_deref().unwrap_or(""),
                    offending = %offending_message.map(|m| m.to_string()).unwrap_or_default(),
                    "server reported a protocol error"
                );
            }
        }
        Ok(())
    }

    async fn route_result(&mut self, id: &str, frame: Value, error: Option<Value>) {
        if self.pending_login.as_ref().is_some_and(|p| p.method_id == id) {
            if let Some(pending) = self.pending_login.take() {
                self.finish_login(pending, frame, error).await;
            }
            return;
        }
        match self.methods.complete(id, frame, error.as_ref()) {
            Some((Some(callback), outcome)) => callback(outcome),
            Some((None, _)) => {}
            None => tracing::debug!(id, "result for unknown method"),
        }
    }

    // -- Auth -----------------------------------------------------------------

    async fn begin_login(
        &mut self,
        transport: &mut Transport,
        method: &str,
        params: Value,
        kind: LoginKind,
        callback: Option<LoginCallback>,
    ) -> anyhow::Result<()> {
        if self.pending_login.is_some() {
            if let Some(callback) = callback {
                callback(Err(DdpError::LogonRejected("a logon is already in flight".to_owned())));
            }
            return Ok(());
        }
        self.shared.set_auth_state(AuthState::LoggingIn);
        let id = self.shared.ids.next_id();
        let frame = ClientMessage::method(id.clone(), method.to_owned(), vec![params]);
        self.pending_login = Some(PendingLogin { method_id: id, kind, callback });
        transport.send(frame.encode()).await
    }

    async fn finish_login(&mut self, pending: PendingLogin, frame: Value, error: Option<Value>) {
        let outcome = match error {
            Some(error) => {
                Err(DdpError::LogonRejected(DdpError::from_server_error(&error).to_string()))
            }
            None => match auth::parse_login_result(frame.get("result").unwrap_or(&Value::Null)) {
                Some(session) => Ok(session),
                None => Err(DdpError::LogonRejected("malformed login result".to_owned())),
            },
        };

        match &outcome {
            Ok(session) => {
                self.shared.set_auth_state(AuthState::LoggedIn);
                self.session_token = Some(session.token.clone());
                *self.shared.auth_session.write().await = Some(session.clone());
                self.shared
                    .events
                    .emit(ClientEvent::SessionUpdate { user_id: Some(session.user_id.clone()) });
            }
            Err(e) => {
                tracing::warn!(err = %e, "login failed");
                self.shared.set_auth_state(AuthState::LoggedOut);
                if matches!(pending.kind, LoginKind::Resume) {
                    self.session_token = None;
                    *self.shared.auth_session.write().await = None;
                    self.shared.events.emit(ClientEvent::SessionUpdate { user_id: None });
                }
            }
        }

        // The connection becomes ready once the resume settles either way.
        if matches!(pending.kind, LoginKind::Resume) {
            self.shared.events.emit(ClientEvent::Ready);
        }
        if let Some(callback) = pending.callback {
            callback(outcome);
        }
    }

    async fn finish_logout(&mut self) {
        self.shared.set_auth_state(AuthState::LoggedOut);
        self.session_token = None;
        *self.shared.auth_session.write().await = None;
        self.shared.events.emit(ClientEvent::SessionUpdate { user_id: None });
    }

    // -- Commands -------------------------------------------------------------

    async fn handle_command(&mut self, transport: Option<&mut Transport>, cmd: Command) -> Flow {
        match cmd {
            Command::Connect => {
                self.connect_requested = true;
                if transport.is_some() {
                    return Flow::TearDown;
                }
                Flow::Continue
            }
            Command::Disconnect => {
                if transport.is_some() {
                    self.disconnect_requested = true;
                    return Flow::TearDown;
                }
                self.reconnect_at = None;
                self.shared.set_session_state(SessionState::Disconnected);
                Flow::Continue
            }
            Command::Subscribe { id, name, params, on_ready } => {
                self.subs.insert(id.clone(), name.clone(), params.clone(), None, on_ready);
                if let Some(transport) = transport {
                    let frame = ClientMessage::sub(id, name, params);
                    if transport.send(frame.encode()).await.is_err() {
                        return Flow::SendFailed;
                    }
                }
                Flow::Continue
            }
            Command::SubscribeMany { group_id, members, on_ready } => {
                let member_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
                self.subs.insert_group(group_id.clone(), member_ids, on_ready);
                for member in &members {
                    self.subs.insert(
                        member.id.clone(),
                        member.name.clone(),
                        member.params.clone(),
                        Some(group_id.clone()),
                        None,
                    );
                }
                if let Some(transport) = transport {
                    for member in members {
                        let frame = ClientMessage::sub(member.id, member.name, member.params);
                        if transport.send(frame.encode()).await.is_err() {
                            return Flow::SendFailed;
                        }
                    }
                }
                Flow::Continue
            }
            Command::Unsubscribe { id } => {
                // A no-op while disconnected.
                let Some(transport) = transport else {
                    return Flow::Continue;
                };
                if self.subs.is_group(&id) {
                    for member in self.subs.group_members(&id) {
                        self.subs.remove_sub(&member);
                        let frame = ClientMessage::Unsub { id: member };
                        if transport.send(frame.encode()).await.is_err() {
                            return Flow::SendFailed;
                        }
                    }
                    self.subs.remove_group(&id);
                } else if self.subs.contains(&id) {
                    self.subs.remove_sub(&id);
                    let frame = ClientMessage::Unsub { id };
                    if transport.send(frame.encode()).await.is_err() {
                        return Flow::SendFailed;
                    }
                }
                Flow::Continue
            }
            Command::Call { id, method, params, callback } => {
                self.send_method(transport, id, method, params, callback).await
            }
            Command::Insert { collection, value, callback } => {
                self.handle_insert(transport, collection, value, callback).await
            }
            Command::Update { collection, id, changes, callback } => {
                let selector = json!({"_id": id});
                let modifier = build_modifier(changes);
                let method_id = self.shared.ids.next_id();
                self.send_method(
                    transport,
                    method_id,
                    format!("/{collection}/update"),
                    vec![selector, modifier],
                    callback,
                )
                .await
            }
            Command::Remove { collection, id, callback } => {
                let event = {
                    let mut store = self.shared.store.write().await;
                    store.apply_removed(&collection, &id)
                };
                self.dispatch_event(event);
                let method_id = self.shared.ids.next_id();
                self.send_method(
                    transport,
                    method_id,
                    format!("/{collection}/remove"),
                    vec![json!({"_id": id})],
                    callback,
                )
                .await
            }
            Command::WatchDocument { watcher, collection, target, callback } => {
                self.dispatcher.watch_document(watcher, &collection, target, callback);
                Flow::Continue
            }
            Command::WatchCollection { watcher, collection, predicate, callback } => {
                self.dispatcher.watch_collection(watcher, &collection, predicate, callback);
                Flow::Continue
            }
            Command::Unwatch { watcher } => {
                self.dispatcher.remove(watcher);
                Flow::Continue
            }
            Command::Login { method, params, callback } => {
                let connected = self.shared.session_state() == SessionState::Connected;
                match transport {
                    Some(transport) if connected => {
                        match self
                            .begin_login(transport, &method, params, LoginKind::Explicit, callback)
                            .await
                        {
                            Ok(()) => Flow::Continue,
                            Err(_) => Flow::SendFailed,
                        }
                    }
                    _ => {
                        if let Some(callback) = callback {
                            callback(Err(DdpError::NotConnected));
                        }
                        Flow::Continue
                    }
                }
            }
            Command::Logout => {
                if let Some(transport) = transport {
                    if self.shared.session_state() == SessionState::Connected {
                        let id = self.shared.ids.next_id();
                        self.methods.register(id.clone(), None);
                        let frame = ClientMessage::method(id, "logout".to_owned(), vec![]);
                        if transport.send(frame.encode()).await.is_err() {
                            return Flow::SendFailed;
                        }
                    }
                }
                self.finish_logout().await;
                Flow::Continue
            }
            Command::Persist { collection } => {
                let debounce = self.shared.config.persist_debounce;
                self.persist_deadlines
                    .entry(collection)
                    .or_insert_with(|| Instant::now() + debounce);
                Flow::Continue
            }
            Command::Restore { collection } => {
                self.run_restore(&collection).await;
                Flow::Continue
            }
            Command::ClearOffline { collection } => {
                self.run_clear_offline(&collection).await;
                Flow::Continue
            }
        }
    }

    /// Register and send one method call; fails the callback with
    /// `NotConnected` when no `Connected` session is up.
    async fn send_method(
        &mut self,
        transport: Option<&mut Transport>,
        id: String,
        method: String,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Flow {
        let connected = self.shared.session_state() == SessionState::Connected;
        match transport {
            Some(transport) if connected => {
                self.methods.register(id.clone(), callback);
                let frame = ClientMessage::method(id, method, params);
                if transport.send(frame.encode()).await.is_err() {
                    return Flow::SendFailed;
                }
                Flow::Continue
            }
            _ => {
                if let Some(callback) = callback {
                    callback(Err(DdpError::NotConnected));
                }
                Flow::Continue
            }
        }
    }

    /// Optimistic insert: fill in a generated `_id` when absent, apply
    /// locally, then RPC `/<collection>/insert`.
    async fn handle_insert(
        &mut self,
        transport: Option<&mut Transport>,
        collection: String,
        value: StoredValue,
        callback: Option<MethodCallback>,
    ) -> Flow {
        let value = match value {
            StoredValue::Raw(mut doc) => {
                let has_id =
                    doc.get("_id").and_then(Value::as_str).is_some_and(|id| !id.is_empty());
                if !has_id {
                    doc.insert("_id".to_owned(), Value::String(protocol::random_document_id()));
                }
                StoredValue::Raw(doc)
            }
            typed => typed,
        };

        let (event, doc) = {
            let mut store = self.shared.store.write().await;
            let codec = store.codec(&collection);
            let doc = value.to_document(codec.as_ref());
            let event = store.insert_local(&collection, value, Origin::Server);
            (event, doc)
        };
        let Some(event) = event else {
            tracing::warn!(%collection, "insert dropped: document lacks an _id");
            if let Some(callback) = callback {
                callback(Err(DdpError::DecodeFailed("insert document lacks an _id".to_owned())));
            }
            return Flow::Continue;
        };
        self.dispatch_event(event);

        let doc = match doc {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(%collection, err = %e, "insert not encodable for RPC");
                if let Some(callback) = callback {
                    callback(Err(DdpError::DecodeFailed(e.to_string())));
                }
                return Flow::Continue;
            }
        };
        let method_id = self.shared.ids.next_id();
        self.send_method(
            transport,
            method_id,
            format!("/{collection}/insert"),
            vec![Value::Object(doc)],
            callback,
        )
        .await
    }

    // -- Offline overlay ------------------------------------------------------

    fn next_persist_deadline(&self) -> Option<Instant> {
        self.persist_deadlines.values().min().copied()
    }

    /// Run persists whose debounce window has elapsed. Serialization
    /// happens under the store lock; the file write goes to a background
    /// task.
    async fn flush_due_persists(&mut self, now: Instant) {
        let due: Vec<String> = self
            .persist_deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(collection, _)| collection.clone())
            .collect();
        for collection in due {
            self.persist_deadlines.remove(&collection);
            let payload = {
                let mut store = self.shared.store.write().await;
                offline::prepare_persist(&mut store, &collection, &self.shared.config.cache_dir)
            };
            match payload {
                Ok(payload) => {
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = offline::write_payload(&payload) {
                            tracing::warn!(err = %e, "offline persist failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(%collection, err = %e, "offline persist skipped"),
            }
        }
    }

    async fn run_restore(&mut self, collection: &str) {
        let events = {
            let mut store = self.shared.store.write().await;
            offline::restore(&mut store, collection, &self.shared.config.cache_dir)
        };
        match events {
            Ok(events) => self.dispatch_events(events),
            Err(e) => tracing::warn!(collection, err = %e, "offline restore failed"),
        }
    }

    async fn run_clear_offline(&mut self, collection: &str) {
        let events = {
            let mut store = self.shared.store.write().await;
            offline::clear_offline(&mut store, collection, &self.shared.config.cache_dir)
        };
        match events {
            Ok(events) => self.dispatch_events(events),
            Err(e) => tracing::warn!(collection, err = %e, "offline clear failed"),
        }
    }

    // -- Dispatch -------------------------------------------------------------

    fn dispatch_event(&mut self, event: ChangeEvent) {
        self.dispatcher.dispatch(&event.collection, event.reason, &event.id, event.value.as_ref());
    }

    fn dispatch_events(&mut self, events: Vec<ChangeEvent>) {
        for event in events {
            self.dispatch_event(event);
        }
    }
}

/// Mongo-shaped `{$set, $unset}` modifier; a null change marks a field
/// for `$unset`.
fn build_modifier(changes: Document) -> Value {
    let mut set = Document::new();
    let mut unset = Document::new();
    for (field, value) in changes {
        if value.is_null() {
            unset.insert(field, json!(""));
        } else {
            set.insert(field, value);
        }
    }
    let mut modifier = Document::new();
    if !set.is_empty() {
        modifier.insert("$set".to_owned(), Value::Object(set));
    }
    if !unset.is_empty() {
        modifier.insert("$unset".to_owned(), Value::Object(unset));
    }
    Value::Object(modifier)
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
