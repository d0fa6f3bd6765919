//! # ysync-provider - keep a yrs document in sync with a room
//!
//! A client-side sync agent: it keeps one shared document and its awareness
//! (presence) directory consistent with remote peers over a reconnecting
//! network connection, and with same-process replicas over a local channel.
//!
//! ## Architecture
//!
//! ```text
//!        application edits                      remote peers
//!               │                                    ▲
//!               ▼                                    │ WebSocket
//! ┌──────────────────────────┐   frames   ┌──────────┴──────────┐
//! │ SharedDoc / Awareness    │ ─────────► │ Provider task       │
//! │ (update + change events) │ ◄───────── │ codec • dispatcher  │
//! └──────────────────────────┘   apply    │ backoff • liveness  │
//!                                         └──────────┬──────────┘
//!                                                    │ LocalBus
//!                                                    ▼
//!                                      same-room providers in-process
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - lib0/y-protocols compatible message codec
//! - [`document`] - document collaborator trait and the yrs-backed [`SharedDoc`]
//! - [`awareness`] - clock-based awareness directory
//! - [`provider`] - the provider handle and its task
//! - [`transport`] - connection traits, WebSocket and mock transports
//! - [`local_bus`] - in-process fan-out between providers
//! - [`relay`] - stateless room relay server
//! - [`config`] - provider and relay configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ysync_provider::{Awareness, Provider, ProviderConfig, SharedDoc};
//!
//! # async fn demo() -> ysync_provider::Result<()> {
//! let doc = Arc::new(SharedDoc::new());
//! let awareness = Arc::new(Awareness::new(doc.client_id()));
//! let provider = Provider::new(&doc, awareness, ProviderConfig::new("ws://localhost:9090", "notes"))?;
//! let mut events = provider.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod awareness;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod local_bus;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod transport;

mod connection;
mod dispatch;
mod liveness;
mod local_sync;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChange, AwarenessStore};
pub use config::{ProviderConfig, RelayConfig};
pub use document::{ClientId, DocUpdate, SharedDoc, SyncDocument, UpdateOrigin};
pub use error::{Result, SyncError};
pub use events::{ConnectionStatus, ProviderEvent};
pub use local_bus::{LocalBus, LocalFrame, LocalSubscription};
pub use protocol::{AuthFrame, Message, MessageKind, SyncFrame, SyncStep};
pub use provider::{Provider, ProviderSnapshot, ShutdownHook};
pub use relay::{RelayServer, RelayStats};
pub use transport::{
    ConnectRequest, Connection, ConnectionId, EventSink, MockConnection, MockTransport, Transport,
    TransportEvent, TransportKind, WsTransport,
};
