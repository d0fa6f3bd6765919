//! Network connection lifecycle.
//!
//! Owns at most one connection at a time and decides when to dial again.
//! Events are tagged with the [`ConnectionId`] of the attempt that produced
//! them; anything from an attempt that is no longer current is ignored, so a
//! late `Close` from an abandoned socket can never tear down its successor.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──Open──▶ Connected
//!       ▲                        │                    │
//!       └──────── Close ─────────┴────── Close ───────┘
//!             (reconnect scheduled after backoff)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;
use crate::events::ConnectionStatus;
use crate::transport::{ConnectRequest, Connection, ConnectionId, EventSink, Transport, TransportEvent};

/// Base reconnect delay; doubled per unsuccessful attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Exponential reconnect backoff.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    max: Duration,
    unsuccessful: u32,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            max,
            unsuccessful: 0,
        }
    }

    /// `min(2^unsuccessful * 100ms, max)`.
    pub fn delay(&self) -> Duration {
        2u32.checked_pow(self.unsuccessful)
            .and_then(|factor| BASE_BACKOFF.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn record_failure(&mut self) {
        self.unsuccessful = self.unsuccessful.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.unsuccessful = 0;
    }

    pub fn unsuccessful(&self) -> u32 {
        self.unsuccessful
    }
}

/// What an event meant for the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Stale or irrelevant event.
    Ignored,
    Opened,
    Message(Vec<u8>),
    Error(String),
    Closed {
        was_connected: bool,
        reason: Option<String>,
    },
}

struct ActiveConnection {
    id: ConnectionId,
    link: Box<dyn Connection>,
}

/// Network side of a provider.
pub(crate) struct NetworkConnection {
    transport: Arc<dyn Transport>,
    request: ConnectRequest,
    events: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    status: ConnectionStatus,
    active: Option<ActiveConnection>,
    next_id: ConnectionId,
    wanted: bool,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
}

impl NetworkConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: ConnectRequest,
        max_backoff: Duration,
        events: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    ) -> Self {
        Self {
            transport,
            request,
            events,
            status: ConnectionStatus::Disconnected,
            active: None,
            next_id: 0,
            wanted: false,
            backoff: Backoff::new(max_backoff),
            reconnect_at: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Whether the application currently wants a connection.
    pub fn is_wanted(&self) -> bool {
        self.wanted
    }

    pub fn unsuccessful_reconnects(&self) -> u32 {
        self.backoff.unsuccessful()
    }

    /// When the next scheduled dial is due, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Dial if no connection exists. Returns `Ok(true)` when a new attempt
    /// started. A failed dial counts as an unsuccessful attempt and
    /// schedules the next one.
    pub fn connect(&mut self) -> Result<bool> {
        self.wanted = true;
        self.reconnect_at = None;
        if self.active.is_some() {
            return Ok(false);
        }

        self.next_id += 1;
        let id = self.next_id;
        let sink = EventSink::new(id, self.events.clone());
        match self.transport.open(&self.request, sink) {
            Ok(link) => {
                log::info!("Connecting to {} (attempt {id})", self.request.url);
                self.active = Some(ActiveConnection { id, link });
                self.status = ConnectionStatus::Connecting;
                Ok(true)
            }
            Err(e) => {
                log::error!("Failed to open connection to {}: {e}", self.request.url);
                self.schedule_reconnect(false);
                Err(e)
            }
        }
    }

    /// A scheduled reconnect fired. No-op if a connection exists or is no
    /// longer wanted.
    pub fn reconnect_due(&mut self) -> Result<bool> {
        self.reconnect_at = None;
        if !self.wanted || self.active.is_some() {
            return Ok(false);
        }
        self.connect()
    }

    /// Interpret an event from the transport.
    pub fn on_event(&mut self, id: ConnectionId, event: TransportEvent) -> Transition {
        match &self.active {
            Some(active) if active.id == id => {}
            _ => {
                log::trace!("Ignoring {event:?} from stale connection {id}");
                return Transition::Ignored;
            }
        }

        match event {
            TransportEvent::Open => {
                self.status = ConnectionStatus::Connected;
                self.backoff.reset();
                log::info!("Connected to {}", self.request.url);
                Transition::Opened
            }
            TransportEvent::Message(data) => Transition::Message(data),
            TransportEvent::Error(error) => {
                log::warn!("Connection error: {error}");
                Transition::Error(error)
            }
            TransportEvent::Close(reason) => self.closed(reason),
        }
    }

    /// Close the current connection and run the close transition now.
    pub fn close(&mut self, reason: Option<String>) -> Option<Transition> {
        let active = self.active.as_mut()?;
        active.link.close();
        Some(self.closed(reason))
    }

    /// Stop wanting a connection and close the current one, if any.
    pub fn disconnect(&mut self) -> Option<Transition> {
        self.wanted = false;
        self.reconnect_at = None;
        self.close(None)
    }

    /// Send on the current connection. Only frames sent while connected go
    /// out; returns whether the frame was queued.
    pub fn send(&mut self, data: Vec<u8>) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        match active.link.send(data) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Send on connection {} failed: {e}", active.id);
                false
            }
        }
    }

    fn closed(&mut self, reason: Option<String>) -> Transition {
        let was_connected = self.status == ConnectionStatus::Connected;
        if let Some(mut active) = self.active.take() {
            active.link.close();
        }
        self.status = ConnectionStatus::Disconnected;
        log::info!(
            "Connection to {} closed{}",
            self.request.url,
            reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        );
        if self.wanted {
            self.schedule_reconnect(was_connected);
        }
        Transition::Closed {
            was_connected,
            reason,
        }
    }

    fn schedule_reconnect(&mut self, was_connected: bool) {
        let delay = self.backoff.delay();
        if !was_connected {
            self.backoff.record_failure();
        }
        log::debug!("Reconnecting in {delay:?}");
        self.reconnect_at = Some(Instant::now() + delay);
    }
}
