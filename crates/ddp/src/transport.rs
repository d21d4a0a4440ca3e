// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport adapter.
//!
//! Owns exactly one live connection. The session loop is the only caller;
//! it creates a transport on connect and drops it on any close path.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events surfaced to the session loop.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A text frame arrived.
    Text(String),
    /// The peer closed the connection or the stream ended.
    Closed,
    /// The socket errored.
    Errored(String),
}

/// One live WebSocket connection.
pub(crate) struct Transport {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

impl Transport {
    /// Open a WebSocket to `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (writer, reader) = stream.split();
        Ok(Self { writer, reader })
    }

    /// Send one text frame.
    pub async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Wait for the next transport event.
    ///
    /// Binary frames and WebSocket-level ping/pong are skipped; DDP
    /// heartbeats travel as text frames.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Text(text.to_string()),
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Err(e)) => return TransportEvent::Errored(e.to_string()),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Close the socket. Errors on an already-dead connection are ignored.
    pub async fn close(&mut self) {
        let _ = self.writer.close().await;
    }
}
