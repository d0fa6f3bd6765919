//! Error taxonomy for the sync provider.
//!
//! None of these are fatal to the process: malformed or unknown frames are
//! logged and dropped, permission denial and transport errors surface as
//! provider events, and a closed transport drives the reconnect path.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced while encoding, dispatching or transporting frames.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Empty, truncated or otherwise undecodable frame.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Frame tag outside the known message kinds.
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u64),

    /// The remote side refused access to the room.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Failure reported by the transport layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is gone.
    #[error("transport closed")]
    TransportClosed,

    /// The document collaborator rejected an update.
    #[error("document error: {0}")]
    Document(String),

    /// The awareness collaborator rejected an update.
    #[error("awareness error: {0}")]
    Awareness(String),

    /// Invalid provider or relay configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider task is gone (destroyed, or its document was dropped).
    #[error("provider destroyed")]
    Destroyed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::MalformedMessage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => SyncError::TransportClosed,
            other => SyncError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
