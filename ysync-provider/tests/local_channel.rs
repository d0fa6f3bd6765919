//! Providers of the same room sharing a process.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use yrs::{Text, WriteTxn};

use ysync_provider::{
    Awareness, LocalBus, Message, MockTransport, Provider, ProviderConfig, SharedDoc, SyncDocument,
    SyncFrame,
};

struct Peer {
    doc: Arc<SharedDoc>,
    awareness: Arc<Awareness>,
    provider: Provider,
}

fn peer(client_id: u64, bus: &Arc<LocalBus>) -> Peer {
    let _ = env_logger::builder().is_test(true).try_init();
    let doc = Arc::new(SharedDoc::with_client_id(client_id));
    let awareness = Arc::new(Awareness::new(client_id));
    // The network never opens; everything goes over the local channel
    let provider = Provider::with_transport(
        &doc,
        awareness.clone(),
        ProviderConfig::new("ws://mock/", "room").with_connect(false),
        Arc::new(MockTransport::new()),
        bus.clone(),
    )
    .unwrap();
    Peer {
        doc,
        awareness,
        provider,
    }
}

fn insert(doc: &SharedDoc, chunk: &str) {
    doc.edit(|txn| {
        let text = txn.get_or_insert_text("body");
        text.insert(txn, 0, chunk);
    });
}

async fn settle(peers: &[&Peer]) {
    // Two rounds: frames published in round one are handled in round two
    for _ in 0..2 {
        for peer in peers {
            peer.provider.snapshot().await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_handshake_and_no_self_echo() {
    let bus = Arc::new(LocalBus::new(64));
    let mut observer = bus.subscribe("ws://mock/room").await;
    let a = peer(1, &bus);

    a.provider.connect().await.unwrap();
    settle(&[&a]).await;

    let mut frames = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_millis(50), observer.recv()).await {
        frames.push(Message::decode(&frame.data).unwrap());
    }
    // Only the handshake; the provider never answers its own frames
    assert_eq!(frames.len(), 4);
    assert!(matches!(frames[0], Message::Sync(SyncFrame::Step1(_))));
    assert_eq!(frames[2], Message::QueryAwareness);
    assert_eq!(a.provider.channel_name(), "ws://mock/room");
    assert!(a.provider.snapshot().await.unwrap().local_channel_connected);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let bus = Arc::new(LocalBus::new(64));
    let a = peer(1, &bus);
    insert(&a.doc, "from a");
    a.awareness.set_local_state(&json!({"name": "A"})).unwrap();
    a.provider.connect().await.unwrap();
    settle(&[&a]).await;

    let b = peer(2, &bus);
    insert(&b.doc, "from b ");
    b.provider.connect().await.unwrap();
    settle(&[&a, &b]).await;

    assert_eq!(a.doc.text("body"), b.doc.text("body"));
    assert!(b.doc.text("body").contains("from a"));
    assert_eq!(b.awareness.state(1), Some(json!({"name": "A"})));
    // The local channel never marks a provider as synced
    assert!(!b.provider.is_synced());
}

#[tokio::test]
async fn test_update_applied_with_identical_bytes_and_not_echoed() {
    let bus = Arc::new(LocalBus::new(64));
    let a = peer(1, &bus);
    let b = peer(2, &bus);
    a.provider.connect().await.unwrap();
    b.provider.connect().await.unwrap();
    settle(&[&a, &b]).await;

    let mut observer = bus.subscribe("ws://mock/room").await;
    let mut a_updates = a.doc.subscribe();
    let mut b_updates = b.doc.subscribe();

    insert(&a.doc, "shared");
    let produced = a_updates.recv().await.unwrap().update;
    let applied = timeout(Duration::from_secs(2), b_updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(applied.update, produced);
    assert_eq!(b.doc.text("body"), "shared");
    settle(&[&a, &b]).await;

    // Exactly one update frame crossed the channel: A's
    let mut updates = 0;
    while let Ok(Some(frame)) = timeout(Duration::from_millis(50), observer.recv()).await {
        if let Message::Sync(SyncFrame::Update(data)) = Message::decode(&frame.data).unwrap() {
            assert_eq!(frame.origin, a.provider.id());
            assert_eq!(data, produced);
            updates += 1;
        }
    }
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn test_disconnect_announces_departure_locally() {
    let bus = Arc::new(LocalBus::new(64));
    let a = peer(1, &bus);
    a.awareness.set_local_state(&json!({"name": "A"})).unwrap();
    let b = peer(2, &bus);
    a.provider.connect().await.unwrap();
    b.provider.connect().await.unwrap();
    settle(&[&a, &b]).await;
    assert!(b.awareness.state(1).is_some());

    a.provider.disconnect().await.unwrap();
    settle(&[&a, &b]).await;

    // The departure carries A's current clock, so B drops A's entry
    assert_eq!(b.awareness.state(1), None);
    assert_eq!(bus.subscriber_count("ws://mock/room").await, 1);
}

#[tokio::test]
async fn test_disabled_local_channel() {
    let bus = Arc::new(LocalBus::new(64));
    let doc = Arc::new(SharedDoc::with_client_id(1));
    let provider = Provider::with_transport(
        &doc,
        Arc::new(Awareness::new(1)),
        ProviderConfig::new("ws://mock", "room")
            .with_connect(false)
            .with_local_channel(false),
        Arc::new(MockTransport::new()),
        bus.clone(),
    )
    .unwrap();

    provider.connect().await.unwrap();
    assert!(!provider.snapshot().await.unwrap().local_channel_connected);
    assert_eq!(bus.channel_count().await, 0);
}
