//! Observable provider events.

use tokio::sync::{broadcast, watch};

/// Network connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Everything a provider reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// Emitted only when the synced flag actually changes.
    Synced(bool),
    ConnectionError(String),
    ConnectionClose(Option<String>),
    CustomMessage { target: String, payload: String },
    /// The remote side refused access. The connection stays open.
    PermissionDenied(String),
}

/// Fan-out of provider events plus the latest status and synced flag.
pub(crate) struct EventEmitter {
    events: broadcast::Sender<ProviderEvent>,
    status: watch::Sender<ConnectionStatus>,
    synced: watch::Sender<bool>,
}

impl EventEmitter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity).0,
            status: watch::channel(ConnectionStatus::Disconnected).0,
            synced: watch::channel(false).0,
        }
    }

    pub(crate) fn emit(&self, event: ProviderEvent) {
        log::trace!("Provider event {event:?}");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
        self.emit(ProviderEvent::Status(status));
    }

    /// Update the synced flag, emitting [`ProviderEvent::Synced`] only on
    /// change. Returns whether the flag changed.
    pub(crate) fn set_synced(&self, value: bool) -> bool {
        let changed = self.synced.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed {
            self.emit(ProviderEvent::Synced(value));
        }
        changed
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }
}
