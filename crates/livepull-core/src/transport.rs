//! Socket seam between the session and a message-oriented transport
//!
//! A [`Connector`] opens a socket without blocking and hands back a
//! [`SocketHandle`]: a receiver of [`SocketEvent`]s and a sender of
//! [`OutboundFrame`]s. The transport reports `Open` once the handshake is
//! done and `Closed` when the socket goes away for any reason.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Event reported by a socket
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Open,
    Text(String),
    Binary(Bytes),
    Closed,
}

/// Frame the session wants written to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Close the socket; no `Closed` event is expected afterwards
    Close,
}

/// Session side of one socket
#[derive(Debug)]
pub struct SocketHandle {
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl SocketHandle {
    /// Queue a text frame. Returns false if the transport is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.send(OutboundFrame::Text(text.into())).is_ok()
    }

    /// Ask the transport to close the socket
    pub fn close(self) {
        let _ = self.outbound.send(OutboundFrame::Close);
    }
}

/// Opens sockets for the session
pub trait Connector: Send + Sync {
    /// Start opening a socket to `url`
    fn connect(&self, url: &Url) -> SocketHandle;
}

/// Server side of an in-memory socket
#[derive(Debug)]
pub struct ServerSocket {
    pub url: Url,
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ServerSocket {
    /// Complete the handshake
    pub fn open(&self) -> bool {
        self.events.send(SocketEvent::Open).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(SocketEvent::Text(text.into())).is_ok()
    }

    pub fn send_binary(&self, payload: impl Into<Bytes>) -> bool {
        self.events.send(SocketEvent::Binary(payload.into())).is_ok()
    }

    /// Drop the connection from the server side
    pub fn close(&self) -> bool {
        self.events.send(SocketEvent::Closed).is_ok()
    }

    /// Next frame written by the client, `None` once the client dropped the socket
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }
}

/// Connector backed by channels, for tests and tooling
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerSocket>,
}

/// Accepts the sockets opened through a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<ServerSocket>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (Self { accepted }, MemoryServer { incoming })
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &Url) -> SocketHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let server = ServerSocket {
            url: url.clone(),
            events: event_tx,
            outbound: out_rx,
        };
        if self.accepted.send(server).is_err() {
            debug!(url = %url, "Memory server gone, socket will never open");
        }

        SocketHandle {
            events: event_rx,
            outbound: out_tx,
        }
    }
}

impl MemoryServer {
    /// Wait for the next socket
    pub async fn accept(&mut self) -> Option<ServerSocket> {
        self.incoming.recv().await
    }
}
