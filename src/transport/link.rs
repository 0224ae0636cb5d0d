//! Frame-level connections used by the persistent transport.

use async_trait::async_trait;
use frames::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::warn;

use crate::error::TransportError;

/// One bidirectional, ordered frame connection.
///
/// `recv` must be cancel safe: the persistent transport polls it inside
/// `tokio::select!`.
#[async_trait]
pub trait Link: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame. `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self);
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// WebSocket link. Sends binary protobuf frames; accepts binary or JSON text.
pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketLink {
    /// Open a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url).await.map_err(|e| {
            warn!(%url, error = %e, "rpc: websocket connect failed");
            TransportError::Disconnected
        })?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let bytes = frames::encode_frame(&frame);
        self.stream
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "rpc: websocket receive failed");
                    return Some(Err(TransportError::Disconnected));
                }
            };
            let decoded = match msg {
                Message::Binary(bytes) => frames::decode_frame(&bytes),
                Message::Text(text) => frames::decode_text(text.as_str()),
                Message::Close(_) => return None,
                _ => continue,
            };
            match decoded {
                Ok(frame) => return Some(Ok(frame)),
                Err(e) => warn!(error = %e, "rpc: dropping malformed inbound frame"),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// In-process link. [`MemoryLink::pair`] returns two connected ends; dropping
/// or closing one end disconnects the other.
pub struct MemoryLink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryLink {
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self { tx: Some(a_tx), rx: b_rx }, Self { tx: Some(b_tx), rx: a_rx })
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let Some(tx) = &self.tx else {
            return Err(TransportError::Disconnected);
        };
        tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
