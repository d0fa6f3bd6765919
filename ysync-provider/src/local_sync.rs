//! Same-process replicas of a room, kept in step over the [`LocalBus`].
//!
//! On enable the provider announces itself with a full handshake so peers
//! already on the channel catch up in both directions. Frames published by
//! this provider come back on its own subscription and are filtered here.

use std::sync::Arc;

use uuid::Uuid;

use crate::awareness::AwarenessStore;
use crate::document::SyncDocument;
use crate::local_bus::{LocalBus, LocalFrame, LocalSubscription};
use crate::protocol::Message;

pub(crate) struct LocalChannel {
    bus: Arc<LocalBus>,
    name: String,
    origin: Uuid,
    subscription: Option<LocalSubscription>,
}

impl LocalChannel {
    pub fn new(bus: Arc<LocalBus>, name: String, origin: Uuid) -> Self {
        Self {
            bus,
            name,
            origin,
            subscription: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    /// Join the channel and run the handshake. No-op if already joined.
    pub async fn enable(&mut self, doc: &dyn SyncDocument, awareness: &dyn AwarenessStore) {
        if self.subscription.is_some() {
            return;
        }
        self.subscription = Some(self.bus.subscribe(&self.name).await);
        log::debug!("Joined local channel {}", self.name);

        let handshake = [
            Message::sync_step1(doc.state_vector()),
            Message::sync_step2(doc.full_state()),
            Message::QueryAwareness,
            Message::awareness(awareness.encode_update(&[awareness.client_id()])),
        ];
        for message in handshake {
            self.publish(message.encode()).await;
        }
    }

    /// Announce departure and leave the channel.
    pub async fn disable(&mut self, departure: Vec<u8>) {
        if self.subscription.is_none() {
            return;
        }
        self.publish(departure).await;
        if let Some(subscription) = self.subscription.take() {
            self.bus.unsubscribe(subscription).await;
            log::debug!("Left local channel {}", self.name);
        }
    }

    /// Publish to the other subscribers. Dropped when not joined.
    pub async fn publish(&self, data: Vec<u8>) {
        if self.subscription.is_some() {
            self.bus.publish(&self.name, Arc::new(data), self.origin).await;
        }
    }

    /// Next frame from another provider. Pending while not joined.
    pub async fn recv(&mut self) -> LocalFrame {
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(frame) = subscription.recv().await {
                if frame.origin != self.origin {
                    return frame;
                }
            }
        }
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::Awareness;
    use crate::document::SharedDoc;
    use crate::protocol::SyncFrame;

    #[tokio::test]
    async fn test_handshake_and_self_filter() {
        let bus = Arc::new(LocalBus::new(16));
        let mut observer = bus.subscribe("ws://h/room").await;

        let doc = SharedDoc::with_client_id(1);
        let awareness = Awareness::new(1);
        let origin = Uuid::new_v4();
        let mut channel = LocalChannel::new(bus.clone(), "ws://h/room".into(), origin);
        channel.enable(&doc, &awareness).await;
        assert!(channel.is_connected());

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let frame = observer.recv().await.unwrap();
            assert_eq!(frame.origin, origin);
            kinds.push(Message::decode(&frame.data).unwrap());
        }
        assert!(matches!(kinds[0], Message::Sync(SyncFrame::Step1(_))));
        assert!(matches!(kinds[1], Message::Sync(SyncFrame::Step2(_))));
        assert_eq!(kinds[2], Message::QueryAwareness);
        assert!(matches!(kinds[3], Message::Awareness(_)));

        // Our own frames are skipped, a peer's frame comes through
        bus.publish("ws://h/room", Arc::new(vec![3]), Uuid::new_v4()).await;
        let frame = channel.recv().await;
        assert_eq!(*frame.data, vec![3]);
    }

    #[tokio::test]
    async fn test_disable_publishes_departure_then_leaves() {
        let bus = Arc::new(LocalBus::new(16));
        let doc = SharedDoc::with_client_id(1);
        let awareness = Awareness::new(1);
        let mut channel = LocalChannel::new(bus.clone(), "c".into(), Uuid::new_v4());
        channel.enable(&doc, &awareness).await;
        let mut observer = bus.subscribe("c").await;

        channel.disable(vec![1, 1, 0]).await;

        assert_eq!(*observer.recv().await.unwrap().data, vec![1, 1, 0]);
        assert!(!channel.is_connected());
        assert_eq!(bus.subscriber_count("c").await, 1);

        // Second disable is a no-op
        channel.disable(vec![9]).await;
        assert_eq!(bus.frames_published(), 5);
    }
}
