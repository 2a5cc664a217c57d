use civic_collab::broadcast::BroadcastGroup;
use civic_collab::document::DocumentStore;
use civic_collab::presence::{Color, PresenceFields, PresenceRegistry, PresenceUpdate};
use civic_collab::protocol::{DeltaFrame, PeerInfo, SyncMessage};
use civic_collab::reconciler::{diff, map_caret};
use civic_collab::storage::{CacheConfig, LocalCache, TextCache};
use civic_collab::transport::OfflineQueue;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

const CHANNEL: &str = "civic-abcdefghij0123456789";

// ─── Document benchmarks ────────────────────────────────────────

fn bench_local_typing_1000_chars(c: &mut Criterion) {
    c.bench_function("document_type_1000_chars", |b| {
        b.iter(|| {
            let mut doc = DocumentStore::new(1);
            for i in 0..1000 {
                black_box(doc.apply_local_insert(i, "a"));
            }
        })
    });
}

fn bench_remote_merge_1000_deltas(c: &mut Criterion) {
    let mut source = DocumentStore::new(1);
    let deltas: Vec<_> = (0..1000).map(|i| source.apply_local_insert(i, "x")).collect();

    c.bench_function("document_merge_1000_deltas", |b| {
        b.iter(|| {
            let mut doc = DocumentStore::new(2);
            for delta in &deltas {
                doc.apply_remote_delta(black_box(delta)).unwrap();
            }
        })
    });
}

fn bench_full_state_10kb(c: &mut Criterion) {
    let mut doc = DocumentStore::new(1);
    doc.apply_local_insert(0, &"lorem ipsum ".repeat(850));

    c.bench_function("document_full_state_10KB", |b| {
        b.iter(|| black_box(doc.full_state()))
    });
}

fn bench_diff_and_caret(c: &mut Criterion) {
    let old = "hello world ".repeat(400);
    let new = format!("{}XX{}", &old[..2400], &old[2400..]);

    c.bench_function("surface_diff_4800_chars", |b| {
        b.iter(|| {
            let edit = diff(black_box(&old), black_box(&new)).unwrap();
            black_box(map_caret(3000, &edit));
        })
    });
}

// ─── Frame benchmarks ───────────────────────────────────────────

fn bench_delta_encode(c: &mut Criterion) {
    let frame = DeltaFrame::new(vec![1, 2, 3], vec![0u8; 64]).encode().unwrap();

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(7), CHANNEL, black_box(1), frame.clone());
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let frame = DeltaFrame::new(vec![1, 2, 3], vec![0u8; 64]).encode().unwrap();
    let encoded = SyncMessage::delta(7, CHANNEL, 1, frame).encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(DeltaFrame::decode(&msg.payload).unwrap());
        })
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let mut registry = PresenceRegistry::new(7, "Alice", Color::palette(0));
    let update = registry.set_local(PresenceFields::default().cursor(Some(42)).typing(true));

    c.bench_function("presence_encode", |b| {
        b.iter(|| {
            let json = black_box(&update).encode().unwrap();
            black_box(SyncMessage::presence(7, CHANNEL, 1, json).encode().unwrap());
        })
    });
}

fn bench_presence_apply_100_peers(c: &mut Criterion) {
    let updates: Vec<PresenceUpdate> = (1..=100u64)
        .map(|id| {
            PresenceRegistry::new(id, format!("User{id}"), Color::from_replica(id))
                .set_local(PresenceFields::default().cursor(Some(id as usize)))
        })
        .collect();

    c.bench_function("presence_apply_100_peers", |b| {
        b.iter(|| {
            let mut registry = PresenceRegistry::new(1000, "Local", Color::default());
            for update in &updates {
                black_box(registry.apply_remote(update));
            }
        })
    });
}

// ─── Fan-out benchmarks ─────────────────────────────────────────

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100u64 {
                    let rx = group
                        .add_peer(Uuid::new_v4(), PeerInfo::with_id(i + 1, format!("Peer{i}")))
                        .await;
                    receivers.push(rx);
                }

                let data = Arc::new(vec![0u8; 64]);
                black_box(group.broadcast_raw(Uuid::new_v4(), black_box(data)));
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

// ─── Cache benchmarks ───────────────────────────────────────────

fn bench_cache_store_load(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("civic_bench_{}", Uuid::new_v4()));
    let mut cache = LocalCache::open(CacheConfig::new(&dir)).unwrap();
    let text = "the quick brown fox ".repeat(200);

    c.bench_function("cache_store_load_4KB", |b| {
        b.iter(|| {
            cache.store("editor-happy", black_box(&text)).unwrap();
            black_box(cache.load("editor-happy").unwrap());
        })
    });

    drop(cache);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_local_typing_1000_chars,
    bench_remote_merge_1000_deltas,
    bench_full_state_10kb,
    bench_diff_and_caret,
    bench_delta_encode,
    bench_delta_decode,
    bench_presence_encode,
    bench_presence_apply_100_peers,
    bench_broadcast_raw,
    bench_offline_queue,
    bench_cache_store_load,
);
criterion_main!(benches);
