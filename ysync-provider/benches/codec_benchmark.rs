use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use uuid::Uuid;
use yrs::{Text, WriteTxn};
use ysync_provider::{
    Awareness, AwarenessStore, LocalBus, Message, SharedDoc, SyncDocument, UpdateOrigin,
};

/// A document with a few hundred small edits.
fn edited_doc(client_id: u64) -> SharedDoc {
    let doc = SharedDoc::with_client_id(client_id);
    for i in 0..300 {
        doc.edit(|txn| {
            let text = txn.get_or_insert_text("body");
            text.insert(txn, i, "x");
        });
    }
    doc
}

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // Typical keystroke update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = Message::update(black_box(update.clone()));
            black_box(msg.encode());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Message::update(vec![0u8; 64]).encode();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_step1_reply(c: &mut Criterion) {
    let doc = edited_doc(1);
    let empty = SharedDoc::with_client_id(2);
    let state_vector = empty.state_vector();

    c.bench_function("step1_reply_300_edits", |b| {
        b.iter(|| {
            let diff = doc.encode_diff(black_box(&state_vector)).unwrap();
            black_box(Message::sync_step2(diff).encode());
        })
    });
}

fn bench_full_state_apply(c: &mut Criterion) {
    let update = edited_doc(1).full_state();

    c.bench_function("full_state_apply_300_edits", |b| {
        b.iter(|| {
            let doc = SharedDoc::with_client_id(2);
            doc.apply_update(black_box(&update), UpdateOrigin::Local)
                .unwrap();
            black_box(doc);
        })
    });
}

fn bench_awareness_encode_100(c: &mut Criterion) {
    let awareness = Awareness::new(0);
    for id in 1..=100u64 {
        let peer = Awareness::new(id);
        peer.set_local_state(&json!({"user": {"name": format!("Peer{id}")}, "cursor": id}))
            .unwrap();
        awareness
            .apply_update(&peer.encode_update(&[id]), UpdateOrigin::Local)
            .unwrap();
    }
    let clients = awareness.client_ids();

    c.bench_function("awareness_encode_100_peers", |b| {
        b.iter(|| {
            black_box(Message::awareness(awareness.encode_update(black_box(&clients))).encode());
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let peer = Awareness::new(7);
    peer.set_local_state(&json!({"user": {"name": "Peer"}, "cursor": 42}))
        .unwrap();
    let update = peer.encode_update(&[7]);

    c.bench_function("awareness_apply_single", |b| {
        b.iter(|| {
            let awareness = Awareness::new(1);
            awareness
                .apply_update(black_box(&update), UpdateOrigin::Local)
                .unwrap();
            black_box(awareness);
        })
    });
}

fn bench_local_bus_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let bus = Arc::new(LocalBus::new(1024));
    let subscriptions: Vec<_> = rt.block_on(async {
        let mut subs = Vec::new();
        for _ in 0..10 {
            subs.push(bus.subscribe("room").await);
        }
        subs
    });
    let data = Arc::new(Message::update(vec![0u8; 64]).encode());
    let origin = Uuid::new_v4();

    c.bench_function("local_bus_publish_10_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(bus.publish("room", data.clone(), origin).await);
            });
        })
    });
    drop(subscriptions);
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_step1_reply,
    bench_full_state_apply,
    bench_awareness_encode_100,
    bench_awareness_apply,
    bench_local_bus_fan_out,
);
criterion_main!(benches);
