// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end conformance tests: a scripted in-process
//! DDP server.
//!
//! The server binds an ephemeral loopback port, answers the DDP
//! handshake (`connect` → `connected`) inline, and hands every accepted
//! connection to the test as a [`ServerConn`] — a pair of channels for
//! inspecting client frames and pushing scripted server frames. It also
//! serves the OAuth completion page under `/_oauth/{service}/` so login
//! flows run against the same endpoint.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use ddp_client::{Client, ClientConfig, ClientEvent};

const TIMEOUT: Duration = Duration::from_secs(5);

static TRACING_INIT: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG`.
/// Safe to call from every test — only the first call has effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Frames and controls pushed from a test into a live connection.
enum Outbound {
    Frame(String),
    Close,
}

/// One accepted client connection, driven by the test.
pub struct ServerConn {
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Outbound>,
}

impl ServerConn {
    /// Push one frame to the client.
    pub fn send(&self, frame: Value) {
        let _ = self.outgoing.send(Outbound::Frame(frame.to_string()));
    }

    /// Drop the connection.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outbound::Close);
    }

    /// Next frame from the client.
    pub async fn recv(&mut self) -> anyhow::Result<Value> {
        let frame = tokio::time::timeout(TIMEOUT, self.incoming.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a client frame"))?;
        frame.ok_or_else(|| anyhow::anyhow!("connection closed"))
    }

    /// Skip frames until one with the given `msg` discriminator arrives.
    pub async fn expect(&mut self, msg: &str) -> anyhow::Result<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["msg"] == msg {
                return Ok(frame);
            }
        }
    }
}

/// Scripted DDP server bound to an ephemeral loopback port.
pub struct SpecServer {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl SpecServer {
    /// Bind and serve `/websocket` (and the OAuth completion page).
    pub async fn start() -> anyhow::Result<Self> {
        let (conn_tx, conns) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/websocket", get(ws_handler))
            .route("/_oauth/{service}/", get(oauth_handler))
            .with_state(conn_tx);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, conns })
    }

    /// `ws://…/websocket` URL for a client.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    /// Wait for the next client connection. The DDP handshake is already
    /// being answered by the server itself.
    pub async fn accept(&mut self) -> anyhow::Result<ServerConn> {
        let conn = tokio::time::timeout(TIMEOUT, self.conns.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a connection"))?;
        conn.ok_or_else(|| anyhow::anyhow!("server stopped"))
    }
}

async fn ws_handler(
    State(conn_tx): State<mpsc::UnboundedSender<ServerConn>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, conn_tx))
}

async fn handle_socket(mut socket: WebSocket, conn_tx: mpsc::UnboundedSender<ServerConn>) {
    let (in_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, mut out_rx) = mpsc::unbounded_channel();
    if conn_tx.send(ServerConn { incoming, outgoing }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    // Answer the handshake inline; every frame still goes
                    // to the test for inspection.
                    if frame["msg"] == "connect" {
                        let connected =
                            json!({"msg": "connected", "session": "spec-session"});
                        if socket
                            .send(Message::Text(connected.to_string().into()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    let _ = in_tx.send(frame);
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
            out = out_rx.recv() => match out {
                Some(Outbound::Frame(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Close) | None => return,
            },
        }
    }
}

/// OAuth completion page with the credential secret in the hidden
/// config div, as Meteor's `_oauth` endpoint renders it.
async fn oauth_handler(Path(service): Path<String>) -> Html<String> {
    let config = json!({
        "setCredentialToken": true,
        "credentialSecret": format!("secret-for-{service}"),
    });
    Html(format!(
        r#"<html><head></head><body><div id="config" style="display:none;">{config}</div></body></html>"#
    ))
}

// -- Client helpers ------------------------------------------------------------

/// Build a client against the spec server with an isolated cache dir and
/// a short persist debounce.
pub fn spec_client(url: &str, cache_dir: &std::path::Path) -> Client {
    init_tracing();
    let mut config = ClientConfig::new(url);
    config.cache_dir = cache_dir.to_path_buf();
    config.persist_debounce = Duration::from_millis(100);
    Client::new(config)
}

/// Wait for a lifecycle event matching the predicate.
pub async fn wait_event(
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    mut want: impl FnMut(&ClientEvent) -> bool,
) -> anyhow::Result<ClientEvent> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a lifecycle event"))??;
        if want(&event) {
            return Ok(event);
        }
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F, Fut>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not reached within timeout")
}

/// Ordered document ids of a collection snapshot.
pub async fn collection_order(client: &Client, collection: &str) -> Vec<String> {
    client
        .documents(collection)
        .await
        .iter()
        .filter_map(|v| v.id().map(str::to_owned))
        .collect()
}
