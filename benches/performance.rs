//! Performance benchmarks for heartbeat ingestion.

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use heartbeat_store::{
    heartbeat_merge, BucketInput, CacheConfig, Datastore, Event, EventData, EventId,
    HeartbeatHandler, LastEventCache, ManualClock, StoreConfig,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const BASE_SECS: i64 = 1_700_000_000;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_SECS + secs, 0).unwrap()
}

fn window(title: &str) -> EventData {
    let mut data = EventData::new();
    data.insert("app".into(), json!("editor"));
    data.insert("title".into(), json!(title));
    data
}

fn bucket() -> BucketInput {
    BucketInput::new("aw-watcher-window", "currentwindow", "bench", "host")
}

/// A handler over a bucket that already holds `history` events.
fn handler_with_history(
    store: Datastore,
    config: CacheConfig,
    history: i64,
) -> (HeartbeatHandler<Datastore>, Arc<ManualClock>) {
    store.create_bucket(bucket()).unwrap();
    let events = (0..history)
        .map(|i| Event::new(at(i * 10), Duration::seconds(5), window(&i.to_string())))
        .collect();
    store.insert_events("aw-watcher-window", events).unwrap();

    let clock = Arc::new(ManualClock::new(at(history * 10)));
    let cache = LastEventCache::with_clock(config, clock.clone());
    (HeartbeatHandler::new(Arc::new(store), cache), clock)
}

/// Benchmark merging heartbeats with and without the last-event cache
fn bench_heartbeat(c: &mut Criterion) {
    let mut group = c.benchmark_group("heartbeat");
    let pulse = Duration::seconds(2);

    for history in [0, 1_000, 10_000] {
        for (name, config) in [
            ("cached", CacheConfig::default()),
            ("uncached", CacheConfig::disabled()),
        ] {
            group.bench_with_input(BenchmarkId::new(name, history), &history, |b, &history| {
                let (handler, clock) =
                    handler_with_history(Datastore::in_memory(), config.clone(), history);
                let mut secs = history * 10;

                b.iter(|| {
                    secs += 1;
                    clock.set(at(secs));
                    let hb = Event::heartbeat(at(secs), window("current"));
                    black_box(handler.heartbeat("aw-watcher-window", hb, pulse).unwrap());
                });
            });
        }
    }

    group.finish();
}

/// Benchmark heartbeats against a file-backed store
fn bench_heartbeat_persistent(c: &mut Criterion) {
    let mut group = c.benchmark_group("heartbeat_persistent");
    let pulse = Duration::seconds(2);

    for sync_interval in [1, 100] {
        group.bench_with_input(
            BenchmarkId::new("sync_interval", sync_interval),
            &sync_interval,
            |b, &sync_interval| {
                let dir = TempDir::new().unwrap();
                let store = Datastore::create(StoreConfig {
                    path: dir.path().join("store"),
                    create_if_missing: true,
                    sync_interval,
                })
                .unwrap();
                let (handler, clock) = handler_with_history(store, CacheConfig::default(), 0);
                let mut secs = 0;

                b.iter(|| {
                    secs += 1;
                    clock.set(at(secs));
                    let hb = Event::heartbeat(at(secs), window("current"));
                    black_box(handler.heartbeat("aw-watcher-window", hb, pulse).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the merge decision alone
fn bench_merge(c: &mut Criterion) {
    let last = Event::new(at(0), Duration::seconds(30), window("current")).with_id(EventId(1));
    let inside = Event::heartbeat(at(31), window("current"));
    let outside = Event::heartbeat(at(120), window("current"));
    let pulse = Duration::seconds(5);

    c.bench_function("merge_within_pulse", |b| {
        b.iter(|| black_box(heartbeat_merge(&last, &inside, pulse)))
    });
    c.bench_function("merge_outside_pulse", |b| {
        b.iter(|| black_box(heartbeat_merge(&last, &outside, pulse)))
    });
}

criterion_group!(benches, bench_heartbeat, bench_heartbeat_persistent, bench_merge);

criterion_main!(benches);
