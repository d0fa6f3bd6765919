//! Document collaborator.
//!
//! The provider never interprets document updates; it only needs a state
//! vector for step 1, a diff for step 2, a way to apply inbound updates and
//! a stream of locally produced updates. [`SharedDoc`] is the yrs-backed
//! implementation used by applications and tests.

use tokio::sync::broadcast;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Transaction, TransactionMut, Update};

use crate::error::{Result, SyncError};

/// Stable identifier of a participant (the yrs client id).
pub type ClientId = u64;

/// Encoded v1 update that carries no structs and no deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Who caused a document or awareness change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// The local application.
    Local,
    /// A provider applying a frame received from a peer.
    Peer(Uuid),
    /// Anything else (shutdown hooks, tests, host code).
    Named(String),
}

/// Update emitted by a document after a change was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub update: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// What the provider needs from a CRDT document.
///
/// Applying the same update twice must be a no-op and must not emit a
/// second [`DocUpdate`].
pub trait SyncDocument: Send + Sync + 'static {
    fn client_id(&self) -> ClientId;

    /// Encoded state vector, sent as sync step 1.
    fn state_vector(&self) -> Vec<u8>;

    /// Everything the holder of `state_vector` is missing.
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>>;

    /// Full document state as a single update.
    fn full_state(&self) -> Vec<u8>;

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()>;

    /// Stream of committed changes. Closed when the document is dropped.
    fn subscribe(&self) -> broadcast::Receiver<DocUpdate>;
}

/// A yrs document that reports its updates on a broadcast channel.
///
/// The inner [`Doc`] is not handed out: every write goes through
/// [`SharedDoc::edit`] so that no committed change escapes the update
/// stream.
pub struct SharedDoc {
    doc: Doc,
    updates: broadcast::Sender<DocUpdate>,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with an explicit client id (for testing).
    pub fn with_client_id(client_id: ClientId) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let (updates, _) = broadcast::channel(1024);
        Self { doc, updates }
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    /// Run a read-only transaction.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Transaction) -> R,
    {
        let txn = self.doc.transact();
        f(&txn)
    }

    /// Run a local edit and publish the resulting update.
    pub fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        self.edit_with(UpdateOrigin::Local, f)
    }

    /// Run an edit attributed to `origin`.
    pub fn edit_with<F, R>(&self, origin: UpdateOrigin, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let (result, update) = {
            let mut txn = self.doc.transact_mut();
            let result = f(&mut txn);
            (result, txn.encode_update_v1())
        };
        if update != EMPTY_UPDATE {
            let _ = self.updates.send(DocUpdate { update, origin });
        }
        result
    }

    /// Current contents of a root-level text, empty if it doesn't exist.
    pub fn text(&self, name: &str) -> String {
        self.read(|txn| {
            txn.get_text(name)
                .map(|text| text.get_string(txn))
                .unwrap_or_default()
        })
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDocument for SharedDoc {
    fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let remote_sv = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::MalformedMessage(format!("state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Document(format!("failed to decode update: {e}")))?;
        let changed = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| SyncError::Document(format!("failed to apply update: {e}")))?;
            txn.encode_update_v1() != EMPTY_UPDATE
        };
        if changed {
            log::trace!("Applied {} byte update from {origin:?}", update.len());
            let _ = self.updates.send(DocUpdate {
                update: update.to_vec(),
                origin,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Text, WriteTxn};

    fn insert(doc: &SharedDoc, at: u32, chunk: &str) {
        doc.edit(|txn| {
            let text = txn.get_or_insert_text("body");
            text.insert(txn, at, chunk);
        });
    }

    #[test]
    fn test_local_edit_emits_update() {
        let doc = SharedDoc::with_client_id(1);
        let mut rx = doc.subscribe();

        insert(&doc, 0, "hello");

        let update = rx.try_recv().unwrap();
        assert_eq!(update.origin, UpdateOrigin::Local);
        assert!(!update.update.is_empty());
        assert_eq!(doc.text("body"), "hello");
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let a = SharedDoc::with_client_id(1);
        let mut rx_a = a.subscribe();
        insert(&a, 0, "shared");
        let produced = rx_a.try_recv().unwrap().update;

        let b = SharedDoc::with_client_id(2);
        let mut rx_b = b.subscribe();
        let origin = UpdateOrigin::Peer(Uuid::new_v4());

        b.apply_update(&produced, origin.clone()).unwrap();
        let seen = rx_b.try_recv().unwrap();
        assert_eq!(seen.update, produced);
        assert_eq!(seen.origin, origin);

        // Second application changes nothing and stays silent
        b.apply_update(&produced, origin).unwrap();
        assert!(rx_b.try_recv().is_err());
        assert_eq!(b.text("body"), "shared");
    }

    #[test]
    fn test_diff_against_state_vector() {
        let a = SharedDoc::with_client_id(1);
        insert(&a, 0, "abc");
        let b = SharedDoc::with_client_id(2);

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&diff, UpdateOrigin::Named("test".into())).unwrap();
        assert_eq!(b.text("body"), "abc");

        // Once caught up, the full state applies without changes
        let mut rx = b.subscribe();
        b.apply_update(&a.full_state(), UpdateOrigin::Named("test".into()))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_garbage_update_rejected() {
        let doc = SharedDoc::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFF, 0xFF], UpdateOrigin::Local),
            Err(SyncError::Document(_))
        ));
        assert!(doc.encode_diff(&[0xFF]).is_err());
    }

    #[test]
    fn test_read_sees_committed_edits() {
        let doc = SharedDoc::with_client_id(5);
        let mut rx = doc.subscribe();
        insert(&doc, 0, "seen");

        let len = doc.read(|txn| txn.get_text("body").map(|text| text.len(txn)));
        assert_eq!(len, Some(4));
        assert_eq!(doc.client_id(), 5);
        // The only way to write is `edit`, and every edit was published
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_noop_edit_is_silent() {
        let doc = SharedDoc::new();
        let mut rx = doc.subscribe();
        doc.edit(|_txn| {});
        assert!(rx.try_recv().is_err());
    }
}
