//! Awareness (presence) directory.
//!
//! Per-participant ephemeral state such as cursor position or user name.
//! Entries carry a logical clock; an update is only accepted when its clock
//! is newer than what we hold, or when it is a same-clock removal. The wire
//! encoding is the y-protocols one so peers written against Yjs interoperate:
//!
//! ```text
//! varUint(count) • { varUint(client) • varUint(clock) • varString(json) }*
//! ```
//!
//! A `null` JSON state marks a departed participant.
//!
//! Entries expire: [`AwarenessStore::refresh`] renews the local state once
//! it is half the outdated timeout old and drops remote entries that were
//! not renewed within the full timeout.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::document::{ClientId, UpdateOrigin};
use crate::error::{Result, SyncError};

/// Participants whose entries changed in one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: UpdateOrigin,
}

impl AwarenessChange {
    /// `added ∪ updated ∪ removed`, in that order.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// What the provider needs from an awareness directory.
pub trait AwarenessStore: Send + Sync + 'static {
    /// The local participant.
    fn client_id(&self) -> ClientId;

    /// Every participant with a live state, local one included.
    fn client_ids(&self) -> Vec<ClientId>;

    fn local_state(&self) -> Option<Value>;

    /// Encode the current entries of `clients`.
    fn encode_update(&self, clients: &[ClientId]) -> Vec<u8>;

    /// Encode the local participant with a null state, announcing departure.
    fn encode_departure(&self) -> Vec<u8>;

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()>;

    fn remove_states(&self, clients: &[ClientId], origin: UpdateOrigin);

    /// Renew the local state and expire silent remote entries. Called
    /// periodically with the outdated timeout.
    fn refresh(&self, outdated: Duration);

    fn subscribe(&self) -> broadcast::Receiver<AwarenessChange>;
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

#[derive(Default)]
struct AwarenessInner {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

/// In-memory awareness directory for one document.
pub struct Awareness {
    client_id: ClientId,
    inner: Mutex<AwarenessInner>,
    updates: broadcast::Sender<AwarenessChange>,
}

impl Awareness {
    /// Create a directory whose local participant starts with an empty
    /// object as its state.
    pub fn new(client_id: ClientId) -> Self {
        let (updates, _) = broadcast::channel(256);
        let awareness = Self {
            client_id,
            inner: Mutex::new(AwarenessInner::default()),
            updates,
        };
        awareness.set_local_state_value(Some(Value::Object(Default::default())));
        awareness
    }

    fn inner(&self) -> MutexGuard<'_, AwarenessInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, change: AwarenessChange) {
        if !change.is_empty() {
            let _ = self.updates.send(change);
        }
    }

    /// Serialize `state` and publish it as the local participant's state.
    pub fn set_local_state<S: Serialize>(&self, state: &S) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| SyncError::Awareness(format!("unserializable state: {e}")))?;
        self.set_local_state_value(if value.is_null() { None } else { Some(value) });
        Ok(())
    }

    /// Mark the local participant as gone.
    pub fn clean_local_state(&self) {
        self.set_local_state_value(None);
    }

    /// Bumps the local clock even if the state is unchanged.
    pub fn set_local_state_value(&self, state: Option<Value>) {
        let client = self.client_id;
        let mut change = AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin: UpdateOrigin::Local,
        };
        {
            let mut inner = self.inner();
            let clock = match inner.meta.get(&client) {
                None => 0,
                Some(meta) => match meta.clock.checked_add(1) {
                    Some(clock) => clock,
                    None => {
                        log::warn!("Local awareness clock exhausted, state not updated");
                        return;
                    }
                },
            };
            let prev = match &state {
                Some(value) => inner.states.insert(client, value.clone()),
                None => inner.states.remove(&client),
            };
            inner.meta.insert(
                client,
                ClientMeta {
                    clock,
                    last_updated: Instant::now(),
                },
            );
            match (state.is_some(), prev.is_some()) {
                (false, _) => change.removed.push(client),
                (true, false) => change.added.push(client),
                (true, true) => change.updated.push(client),
            }
        }
        self.emit(change);
    }

    /// State of one participant.
    pub fn state(&self, client: ClientId) -> Option<Value> {
        self.inner().states.get(&client).cloned()
    }

    /// Snapshot of every live state.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.inner().states.clone()
    }

    /// Current clock of a participant, if it was ever seen.
    pub fn clock(&self, client: ClientId) -> Option<u32> {
        self.inner().meta.get(&client).map(|m| m.clock)
    }

    fn encode_entries(&self, clients: &[ClientId], with_states: bool) -> Vec<u8> {
        let inner = self.inner();
        let entries: Vec<(ClientId, u32, String)> = clients
            .iter()
            .filter_map(|client| {
                let meta = inner.meta.get(client)?;
                let json = match inner.states.get(client) {
                    Some(state) if with_states => state.to_string(),
                    _ => "null".to_string(),
                };
                Some((*client, meta.clock, json))
            })
            .collect();

        let mut buf = Vec::new();
        buf.write_var(entries.len() as u64);
        for (client, clock, json) in &entries {
            buf.write_var(*client);
            buf.write_var(*clock);
            buf.write_string(json);
        }
        buf
    }
}

fn decode_entries(update: &[u8]) -> Result<Vec<(ClientId, u32, Option<Value>)>> {
    let mut cursor = Cursor::new(update);
    let len: u64 = cursor.read_var()?;
    let mut entries = Vec::new();
    for _ in 0..len {
        let client: ClientId = cursor.read_var()?;
        let clock: u32 = cursor.read_var()?;
        let json = cursor.read_string()?;
        let state: Value = serde_json::from_str(json)
            .map_err(|e| SyncError::Awareness(format!("invalid state for {client}: {e}")))?;
        entries.push((client, clock, if state.is_null() { None } else { Some(state) }));
    }
    Ok(entries)
}

impl AwarenessStore for Awareness {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn client_ids(&self) -> Vec<ClientId> {
        self.inner().states.keys().copied().collect()
    }

    fn local_state(&self) -> Option<Value> {
        self.state(self.client_id)
    }

    fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        self.encode_entries(clients, true)
    }

    fn encode_departure(&self) -> Vec<u8> {
        self.encode_entries(&[self.client_id], false)
    }

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let entries = decode_entries(update)?;
        let mut change = AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        };
        {
            let mut inner = self.inner();
            let now = Instant::now();
            for (client, mut clock, state) in entries {
                if client == self.client_id && clock == u32::MAX {
                    log::warn!("Ignoring entry for local client {client} at unbeatable clock");
                    continue;
                }
                let known = inner.meta.get(&client).copied();
                let current_clock = known.map_or(0, |m| m.clock);
                let accept = current_clock < clock
                    || (current_clock == clock
                        && state.is_none()
                        && inner.states.contains_key(&client));
                if !accept {
                    continue;
                }

                let had_state = inner.states.contains_key(&client);
                match &state {
                    None if client == self.client_id && had_state => {
                        // A peer may not remove our own entry; outbid it instead
                        clock = clock.saturating_add(1);
                    }
                    None => {
                        inner.states.remove(&client);
                    }
                    Some(value) => {
                        inner.states.insert(client, value.clone());
                    }
                }
                inner.meta.insert(
                    client,
                    ClientMeta {
                        clock,
                        last_updated: now,
                    },
                );

                match (had_state, state.is_some()) {
                    (false, true) => change.added.push(client),
                    (true, false) => change.removed.push(client),
                    (true, true) => change.updated.push(client),
                    (false, false) => {}
                }
            }
        }
        self.emit(change);
        Ok(())
    }

    fn remove_states(&self, clients: &[ClientId], origin: UpdateOrigin) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner();
            for client in clients {
                if inner.states.remove(client).is_some() {
                    if *client == self.client_id {
                        if let Some(meta) = inner.meta.get_mut(client) {
                            meta.clock = meta.clock.saturating_add(1);
                            meta.last_updated = Instant::now();
                        }
                    }
                    removed.push(*client);
                }
            }
        }
        self.emit(AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed,
            origin,
        });
    }

    fn refresh(&self, outdated: Duration) {
        let now = Instant::now();
        let renew = {
            let inner = self.inner();
            match (inner.states.get(&self.client_id), inner.meta.get(&self.client_id)) {
                (Some(state), Some(meta))
                    if now.duration_since(meta.last_updated) >= outdated / 2 =>
                {
                    Some(state.clone())
                }
                _ => None,
            }
        };
        if let Some(state) = renew {
            log::trace!("Renewing local awareness state of {}", self.client_id);
            self.set_local_state_value(Some(state));
        }

        let mut removed = Vec::new();
        {
            let mut inner = self.inner();
            let expired: Vec<ClientId> = inner
                .meta
                .iter()
                .filter(|(client, meta)| {
                    **client != self.client_id
                        && now.duration_since(meta.last_updated) >= outdated
                        && inner.states.contains_key(*client)
                })
                .map(|(client, _)| *client)
                .collect();
            for client in expired {
                inner.states.remove(&client);
                removed.push(client);
            }
        }
        if !removed.is_empty() {
            log::debug!("Expired awareness of {removed:?}");
        }
        self.emit(AwarenessChange {
            added: Vec::new(),
            updated: Vec::new(),
            removed,
            origin: UpdateOrigin::Named("timeout".into()),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<AwarenessChange> {
        self.updates.subscribe()
    }
}
