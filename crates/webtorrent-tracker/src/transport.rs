//! Tracker connection abstraction and the websocket implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed")]
    Closed,
}

/// One live, bidirectional text connection to a tracker.
#[async_trait]
pub trait TrackerConnection: Send + Sync {
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Waits for the next text frame. Any error ends the connection.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Idempotent; a pending `recv` returns `Closed`.
    async fn close(&self);
}

#[async_trait]
pub trait TrackerDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn TrackerConnection>, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketDialer;

impl WebSocketDialer {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn tracker_url(url: &str) -> Result<Url, TransportError> {
    let parsed = Url::parse(url)
        .map_err(|err| TransportError::Setup(format!("invalid tracker url {url}: {err}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(TransportError::Setup(format!(
            "tracker url must use ws or wss, got {other}"
        ))),
    }
}

#[async_trait]
impl TrackerDialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn TrackerConnection>, TransportError> {
        let url = tracker_url(url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "webtorrent", url = %url, "tracker websocket connected");
        Ok(Arc::new(WebSocketConnection::new(stream)))
    }
}

pub struct WebSocketConnection {
    sink: AsyncMutex<SplitSink<WsStream, Message>>,
    stream: AsyncMutex<SplitStream<WsStream>>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketConnection {
    fn new(stream: WsStream) -> Self {
        let (sink, stream) = stream.split();
        let (shutdown, _) = watch::channel(false);
        Self {
            sink: AsyncMutex::new(sink),
            stream: AsyncMutex::new(stream),
            shutdown,
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[async_trait]
impl TrackerConnection for WebSocketConnection {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Closed);
        }
        tracing::trace!(target = "webtorrent", event = "ws_out", len = text.len());
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(TransportError::Closed),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(target = "webtorrent", event = "ws_in", kind = "text", len = text.len());
                    return Ok(text);
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::trace!(target = "webtorrent", event = "ws_in", kind = "binary", len = data.len());
                    match String::from_utf8(data) {
                        Ok(text) => return Ok(text),
                        Err(err) => {
                            tracing::debug!(target = "webtorrent", error = %err, "dropping non-utf8 binary frame");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(target = "webtorrent", ?frame, "tracker sent close frame");
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                )) => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(TransportError::Receive(err.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        if let Err(err) = self.sink.lock().await.close().await {
            tracing::debug!(target = "webtorrent", error = %err, "error closing tracker websocket");
        }
    }
}
