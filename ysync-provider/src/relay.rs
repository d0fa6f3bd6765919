//! WebSocket relay with room-based routing.
//!
//! ```text
//! Client A ──┐                     ┌──▶ Client B
//!            ├── Room ── LocalBus ─┤
//! Client C ──┘                     └──▶ Client A, C (never the sender)
//! ```
//!
//! The relay holds no document state. Every binary frame is forwarded
//! verbatim to every other connection of the same room; sync step 1 from a
//! newcomer reaches the peers already present and their step 2 replies
//! flow back the same way. Awareness frames also go back to their sender,
//! so a client alone in a room still hears its own periodic renewals. The room comes from the request path (`/notes`)
//! or, when the path is empty, from the `roomname` query parameter.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::RelayConfig;
use crate::error::{Result, SyncError};
use crate::local_bus::LocalBus;
use crate::protocol::MessageKind;

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Room-routing WebSocket relay. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<LocalBus>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(LocalBus::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.channel_count().await;
        stats
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut uri = None;
        let capture = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            uri = Some(request.uri().clone());
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let Some(room) = uri.as_ref().and_then(room_from_uri) else {
            log::warn!("Rejecting {addr}: no room in request");
            ws_sender.send(close_message("missing room")).await?;
            return Ok(());
        };
        if self.rooms.subscriber_count(&room).await >= self.config.max_peers_per_room {
            log::warn!("Rejecting {addr}: room {room} is full");
            ws_sender.send(close_message("room full")).await?;
            return Ok(());
        }

        let mut subscription = self.rooms.subscribe(&room).await;
        let origin = subscription.id();
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Connection {origin} from {addr} joined room {room}");

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let echo = is_awareness(&data);
                        self.rooms.publish(&room, Arc::new(data.to_vec()), origin).await;
                        if echo {
                            if let Err(e) = ws_sender.send(WsMessage::Binary(data)).await {
                                break Err(SyncError::from(e));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(SyncError::from(e)),
                },
                frame = subscription.recv() => match frame {
                    Some(frame) if frame.origin == origin => {}
                    Some(frame) => {
                        let data = frame.data.as_ref().clone();
                        if let Err(e) = ws_sender.send(WsMessage::Binary(data.into())).await {
                            break Err(SyncError::from(e));
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        self.rooms.unsubscribe(subscription).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {origin} left room {room}");

        match result {
            Err(SyncError::TransportClosed) => Ok(()),
            other => other,
        }
    }
}

/// Message kind tags below 128 are a single varint byte.
fn is_awareness(frame: &[u8]) -> bool {
    frame.first().map(|tag| u64::from(*tag)) == Some(MessageKind::Awareness.tag())
}

fn close_message(reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: reason.to_owned().into(),
    }))
}

/// Room named by the request path, else by the `roomname` query parameter.
fn room_from_uri(uri: &Uri) -> Option<String> {
    let path = uri.path().trim_matches('/');
    let raw = if path.is_empty() {
        uri.query()?
            .split('&')
            .find_map(|pair| pair.strip_prefix("roomname="))?
    } else {
        path
    };
    let room = urlencoding::decode(raw).ok()?.into_owned();
    (!room.is_empty()).then_some(room)
}
