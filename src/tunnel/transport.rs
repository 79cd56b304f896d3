//! WebSocket transport for the tunnel.
//!
//! [`WsTransport`] wraps tokio-tungstenite. `connect` installs the bearer
//! header on the upgrade request, splits the stream, and spawns a reader
//! task whose only job is to push events into an unbounded queue; the agent
//! drains that queue from `tick()`. Nothing is torn down from inside the
//! reader — on close or error it emits `Disconnected` and exits, and the
//! agent performs the actual teardown on its next tick.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Type alias for the WS sink to reduce verbosity.
type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Events surfaced to the agent tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame arrived.
    Text(String),
    /// The socket closed or errored. Emitted at most once per connection.
    Disconnected,
}

/// Errors from socket operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel connect failed: {0}")]
    Connect(String),
    #[error("tunnel send failed: {0}")]
    Send(String),
    #[error("tunnel socket not connected")]
    NotConnected,
}

/// Seam between the agent and the WebSocket library. Tests script this.
#[async_trait]
pub trait TunnelSocket: Send {
    /// Open the socket to `url` with `Authorization: Bearer <token>`.
    /// Returning `Ok` means the upgrade completed.
    async fn connect(&mut self, url: &str, bearer: &str) -> Result<(), TunnelError>;

    /// Send one text frame.
    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError>;

    /// Non-blocking drain of the next queued event.
    fn poll_event(&mut self) -> Option<SocketEvent>;

    /// Tear the connection down and release resources. Idempotent.
    async fn close(&mut self);
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport {
    sink: Option<WsSink>,
    events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            sink: None,
            events: None,
            reader: None,
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelSocket for WsTransport {
    async fn connect(&mut self, url: &str, bearer: &str) -> Result<(), TunnelError> {
        // A previous connection must be fully released first.
        self.close().await;

        let mut request = url
            .into_client_request()
            .map_err(|e| TunnelError::Connect(format!("invalid tunnel URL: {e}")))?;
        let header = HeaderValue::from_str(&format!("Bearer {bearer}"))
            .map_err(|e| TunnelError::Connect(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws_stream, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| TunnelError::Connect("connect timed out".to_string()))?
        .map_err(|e| TunnelError::Connect(e.to_string()))?;

        let (sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if tx.send(SocketEvent::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Tunnel close frame: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Tunnel read error: {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(SocketEvent::Disconnected);
        });

        self.sink = Some(sink);
        self.events = Some(rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), TunnelError> {
        let sink = self.sink.as_mut().ok_or(TunnelError::NotConnected)?;
        sink.send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| TunnelError::Send(e.to_string()))
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.events = None;
    }
}
