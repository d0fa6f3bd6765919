//! WebSocket transport over tokio-tungstenite.
//!
//! Each connection runs in its own task: it dials, then multiplexes the
//! outgoing command channel and the incoming stream until either side
//! closes. Binary frames only; text, ping and pong frames are ignored.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{ConnectRequest, Connection, EventSink, Transport, TransportEvent, TransportKind};
use crate::error::{Result, SyncError};

/// Opens WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

enum Command {
    Send(Vec<u8>),
    Close,
}

struct WsConnection {
    commands: mpsc::UnboundedSender<Command>,
    closed: bool,
}

impl Connection for WsConnection {
    fn send(&mut self, data: Vec<u8>) -> Result<()> {
        if self.closed {
            return Err(SyncError::TransportClosed);
        }
        self.commands
            .send(Command::Send(data))
            .map_err(|_| SyncError::TransportClosed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.commands.send(Command::Close);
        }
    }
}

impl Transport for WsTransport {
    fn open(&self, request: &ConnectRequest, events: EventSink) -> Result<Box<dyn Connection>> {
        if !request.transports.is_empty() && !request.transports.contains(&TransportKind::WebSocket)
        {
            return Err(SyncError::Config(format!(
                "no supported transport in {:?}",
                request.transports
            )));
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let url = request.url.clone();
        tokio::spawn(run_connection(url, events, rx));
        Ok(Box::new(WsConnection {
            commands,
            closed: false,
        }))
    }
}

async fn run_connection(
    url: String,
    events: EventSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let id = events.connection_id();
    log::debug!("Connection {id}: dialing {url}");

    let connecting = tokio_tungstenite::connect_async(url.as_str());
    tokio::pin!(connecting);
    let dialed = loop {
        tokio::select! {
            result = &mut connecting => break result,
            cmd = commands.recv() => match cmd {
                Some(Command::Send(_)) => {
                    log::warn!("Connection {id}: dropping frame sent before open");
                }
                Some(Command::Close) | None => {
                    events.send(TransportEvent::Close(None));
                    return;
                }
            },
        }
    };

    let stream = match dialed {
        Ok((stream, _response)) => stream,
        Err(e) => {
            log::debug!("Connection {id}: dial failed: {e}");
            events.send(TransportEvent::Error(e.to_string()));
            events.send(TransportEvent::Close(None));
            return;
        }
    };

    if !events.send(TransportEvent::Open) {
        return;
    }
    let (mut writer, mut reader) = stream.split();

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(data)) => {
                    if let Err(e) = writer.send(WsMessage::Binary(data.into())).await {
                        events.send(TransportEvent::Error(e.to_string()));
                        break None;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = writer.send(WsMessage::Close(None)).await;
                    break None;
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    if !events.send(TransportEvent::Message(data.to_vec())) {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.as_str().to_owned())
                        .filter(|reason| !reason.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.send(TransportEvent::Error(e.to_string()));
                    break None;
                }
                None => break None,
            },
        }
    };

    log::debug!("Connection {id}: closed ({reason:?})");
    events.send(TransportEvent::Close(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, transports: Vec<TransportKind>) -> ConnectRequest {
        ConnectRequest {
            url: url.to_string(),
            transports,
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Port 1 is reserved and refuses connections
        let _conn = WsTransport
            .open(
                &request("ws://127.0.0.1:1/room", vec![TransportKind::WebSocket]),
                EventSink::new(7, tx),
            )
            .unwrap();

        let mut saw_close = false;
        while let Some((id, event)) = rx.recv().await {
            assert_eq!(id, 7);
            if let TransportEvent::Close(_) = event {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_requires_websocket_preference() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WsTransport.open(
            &request("ws://127.0.0.1:1/room", vec![TransportKind::WebTransport]),
            EventSink::new(1, tx),
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
