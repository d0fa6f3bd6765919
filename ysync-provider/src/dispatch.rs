//! Inbound frame handling.
//!
//! The dispatcher decodes one frame, applies it to the document or the
//! awareness directory and returns the reply to send back on the channel the
//! frame came from. It never sends anything itself.

use crate::awareness::AwarenessStore;
use crate::document::{SyncDocument, UpdateOrigin};
use crate::error::SyncError;
use crate::events::{EventEmitter, ProviderEvent};
use crate::protocol::{AuthFrame, Message, SyncFrame};

/// Borrowed view of the provider state a frame may touch.
pub(crate) struct Dispatcher<'a> {
    pub doc: &'a dyn SyncDocument,
    pub awareness: &'a dyn AwarenessStore,
    /// Origin attached to everything applied from remote frames.
    pub origin: &'a UpdateOrigin,
    pub events: &'a EventEmitter,
}

impl Dispatcher<'_> {
    /// Handle `bytes`. `emit_synced` is true only for frames that arrived
    /// over the network connection.
    ///
    /// Replies consisting of a bare tag are suppressed.
    pub fn dispatch(&self, bytes: &[u8], emit_synced: bool) -> Option<Vec<u8>> {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(SyncError::UnknownMessageKind(tag)) => {
                log::error!("Unable to compute message: unknown kind {tag}");
                return None;
            }
            Err(e) => {
                log::warn!("Dropping {} byte frame: {e}", bytes.len());
                return None;
            }
        };
        log::debug!("Dispatching {:?} frame", message.kind());

        let reply = match message {
            Message::Sync(frame) => self.handle_sync(frame, emit_synced),
            Message::QueryAwareness => {
                let clients = self.awareness.client_ids();
                Some(Message::awareness(self.awareness.encode_update(&clients)))
            }
            Message::Awareness(update) => {
                if let Err(e) = self.awareness.apply_update(&update, self.origin.clone()) {
                    log::warn!("Rejected awareness update: {e}");
                }
                None
            }
            Message::Auth(AuthFrame::PermissionDenied { reason }) => {
                log::warn!("Permission denied to access room: {reason}");
                self.events.emit(ProviderEvent::PermissionDenied(reason));
                None
            }
            Message::Custom { target, payload } => {
                self.events
                    .emit(ProviderEvent::CustomMessage { target, payload });
                None
            }
        };

        reply.map(|m| m.encode()).filter(|bytes| bytes.len() > 1)
    }

    fn handle_sync(&self, frame: SyncFrame, emit_synced: bool) -> Option<Message> {
        match frame {
            SyncFrame::Step1(state_vector) => match self.doc.encode_diff(&state_vector) {
                Ok(diff) => Some(Message::sync_step2(diff)),
                Err(e) => {
                    log::warn!("Cannot answer sync step 1: {e}");
                    None
                }
            },
            SyncFrame::Step2(update) => {
                match self.doc.apply_update(&update, self.origin.clone()) {
                    Ok(()) if emit_synced => {
                        self.events.set_synced(true);
                    }
                    Ok(()) => {}
                    Err(e) => log::warn!("Rejected sync step 2: {e}"),
                }
                None
            }
            SyncFrame::Update(update) => {
                if let Err(e) = self.doc.apply_update(&update, self.origin.clone()) {
                    log::warn!("Rejected update: {e}");
                }
                None
            }
        }
    }
}
