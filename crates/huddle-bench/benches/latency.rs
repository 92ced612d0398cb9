//! Latency benchmarks for Huddle.
//!
//! These benchmarks focus on the path from a bridge publish to a member's
//! outbound queue.

use criterion::{criterion_group, criterion_main, Criterion};
use futures_util::StreamExt;
use huddle_bench::message;
use huddle_core::{IngressBridge, LocalBridge};
use huddle_protocol::{decode, encode, MAX_FRAME_SIZE};
use std::time::Instant;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");
    let envelope = message("general", 256);

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = encode(&envelope).unwrap();
            decode(&encoded, MAX_FRAME_SIZE).unwrap()
        });
    });

    group.finish();
}

/// Benchmark publish + receive through the in-process bridge.
fn bench_bridge_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge_latency");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let payload = encode(&message("general", 64)).unwrap();

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let bridge = LocalBridge::new();
                let mut feed = bridge.subscribe("general").await.unwrap();

                let start = Instant::now();
                for _ in 0..iters {
                    bridge.publish("general", payload.clone()).await.unwrap();
                    let _ = feed.next().await;
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("ten_rooms", |b| {
        b.iter_custom(|iters| {
            runtime.block_on(async {
                let bridge = LocalBridge::new();
                let rooms: Vec<String> = (0..10).map(|i| format!("room-{i}")).collect();
                let mut feeds = Vec::with_capacity(rooms.len());
                for room in &rooms {
                    feeds.push(bridge.subscribe(room).await.unwrap());
                }

                let start = Instant::now();
                for _ in 0..iters {
                    for (room, feed) in rooms.iter().zip(feeds.iter_mut()) {
                        bridge.publish(room, payload.clone()).await.unwrap();
                        let _ = feed.next().await;
                    }
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_codec_roundtrip, bench_bridge_latency);
criterion_main!(benches);
