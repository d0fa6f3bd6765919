//! In-process fan-out keyed by channel name.
//!
//! Uses tokio broadcast channels so that a publish is O(1) regardless of the
//! number of subscribers. Every frame carries the id of its publisher;
//! receivers filter their own frames out. Channels are created on first
//! subscribe and dropped when the last subscriber leaves.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Default number of frames buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// A frame on the bus.
#[derive(Debug, Clone)]
pub struct LocalFrame {
    /// Publisher id.
    pub origin: Uuid,
    pub data: Arc<Vec<u8>>,
}

/// Handle returned by [`LocalBus::subscribe`].
pub struct LocalSubscription {
    id: Uuid,
    channel: String,
    rx: broadcast::Receiver<LocalFrame>,
}

impl LocalSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next frame on the channel. Returns `None` once the channel is gone.
    /// Frames lost to lag are skipped with a warning.
    pub async fn recv(&mut self) -> Option<LocalFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Local channel {} lagged, skipped {n} frames", self.channel);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct BusChannel {
    sender: broadcast::Sender<LocalFrame>,
    subscribers: HashSet<Uuid>,
}

/// Publish/subscribe bus shared by every provider in the process.
pub struct LocalBus {
    channels: RwLock<HashMap<String, BusChannel>>,
    capacity: usize,
    frames_published: AtomicU64,
}

impl LocalBus {
    /// Create a bus whose channels buffer `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
            frames_published: AtomicU64::new(0),
        }
    }

    /// The process-wide default bus.
    pub fn global() -> Arc<LocalBus> {
        static GLOBAL: OnceLock<Arc<LocalBus>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(LocalBus::new(DEFAULT_BUS_CAPACITY)))
            .clone()
    }

    /// Join `channel`, creating it if needed.
    pub async fn subscribe(&self, channel: &str) -> LocalSubscription {
        let id = Uuid::new_v4();
        let mut channels = self.channels.write().await;
        let entry = channels.entry(channel.to_string()).or_insert_with(|| {
            log::debug!("Local channel {channel} created");
            BusChannel {
                sender: broadcast::channel(self.capacity).0,
                subscribers: HashSet::new(),
            }
        });
        entry.subscribers.insert(id);
        LocalSubscription {
            id,
            channel: channel.to_string(),
            rx: entry.sender.subscribe(),
        }
    }

    /// Leave the channel. Empty channels are removed.
    pub async fn unsubscribe(&self, subscription: LocalSubscription) {
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels.get_mut(&subscription.channel) {
            entry.subscribers.remove(&subscription.id);
            if entry.subscribers.is_empty() {
                channels.remove(&subscription.channel);
                log::debug!("Local channel {} dropped", subscription.channel);
            }
        }
    }

    /// Deliver `data` to every subscriber of `channel`, the publisher's own
    /// subscription included. Returns the number of receivers reached.
    pub async fn publish(&self, channel: &str, data: Arc<Vec<u8>>, origin: Uuid) -> usize {
        // Fast path: read lock only
        let channels = self.channels.read().await;
        let Some(entry) = channels.get(channel) else {
            return 0;
        };
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        entry.sender.send(LocalFrame { origin, data }).unwrap_or(0)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Total frames published since creation.
    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
