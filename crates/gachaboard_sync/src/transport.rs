//! Duplex socket abstraction handed to the engine.
//!
//! The server adapts an axum `WebSocket` to [`Transport`]; tests and
//! in-process clients use [`memory_pair`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}

/// A text-framed duplex connection to one client.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Next text frame from the client, or `None` once the client has gone.
    ///
    /// Must be cancel-safe: the session loop races it against its outbound queue.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Server-initiated close. Tolerates a peer that is already gone.
    async fn close(&mut self, reason: &str);
}

// ==================== In-memory transport ====================

/// What the client end of a memory transport observes.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFrame {
    Text(String),
    Close(String),
}

/// Server end of an in-memory connection.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<PeerFrame>,
}

/// Client end of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<PeerFrame>,
}

/// Create a connected transport/peer pair.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (client_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, client_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { inbound, outbound },
        MemoryPeer {
            tx: Some(client_tx),
            rx: client_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(PeerFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, reason: &str) {
        let _ = self.outbound.send(PeerFrame::Close(reason.to_string()));
        self.inbound.close();
    }
}

impl MemoryPeer {
    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.into());
        }
    }

    pub fn send(&self, msg: &ClientMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            self.send_raw(json);
        }
    }

    /// Next decoded server message; `None` once the server closed the socket.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.rx.recv().await? {
                PeerFrame::Text(text) => {
                    if let Ok(msg) = serde_json::from_str(&text) {
                        return Some(msg);
                    }
                }
                PeerFrame::Close(_) => return None,
            }
        }
    }

    /// Next raw frame, including the server's close.
    pub async fn recv_frame(&mut self) -> Option<PeerFrame> {
        self.rx.recv().await
    }

    /// Hang up from the client side.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}
