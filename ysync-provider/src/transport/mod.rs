//! Transport abstraction for the network channel.
//!
//! A [`Transport`] opens [`Connection`]s. Each connection reports what
//! happens to it through an [`EventSink`] tagged with the id the provider
//! assigned when opening it, so events from a connection the provider has
//! already abandoned can be recognised and ignored.
//!
//! Implementations:
//! - [`WsTransport`]: WebSocket via tokio-tungstenite
//! - [`MockTransport`]: scripted connections for tests

mod mock;
mod websocket;

pub use mock::{MockConnection, MockTransport};
pub use websocket::WsTransport;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifier of one connection attempt within a provider.
pub type ConnectionId = u64;

/// Something that happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Open,
    /// A binary frame arrived.
    Message(Vec<u8>),
    /// A non-fatal error. A `Close` follows if the connection is lost.
    Error(String),
    /// The connection is gone. Carries the close reason if there is one.
    Close(Option<String>),
}

/// Preferred wire transports, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    WebTransport,
}

/// Everything a transport needs to reach a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Full endpoint url, room and query parameters included.
    pub url: String,
    pub transports: Vec<TransportKind>,
}

/// Delivers events of one connection to its provider.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
}

impl EventSink {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Returns false once the provider is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// A live (or establishing) connection.
pub trait Connection: Send {
    /// Queue a binary frame. Frames are delivered in call order.
    fn send(&mut self, data: Vec<u8>) -> Result<()>;

    /// Tear the connection down. Idempotent.
    fn close(&mut self);
}

/// Factory for connections.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting. Progress is reported on `events`, starting with
    /// [`TransportEvent::Open`] or [`TransportEvent::Close`].
    fn open(&self, request: &ConnectRequest, events: EventSink) -> Result<Box<dyn Connection>>;
}
