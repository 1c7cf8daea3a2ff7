//! End-to-end heartbeat scenarios against a file-backed store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use heartbeat_store::{
    BucketInput, CacheConfig, Datastore, Event, EventData, EventId, EventQuery, EventStore,
    HeartbeatHandler, LastEventCache, LastEventSource, ManualClock, Result, StoreConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn app(name: &str) -> EventData {
    let mut data = EventData::new();
    data.insert("app".into(), json!(name));
    data
}

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        sync_interval: 1,
    }
}

fn open_store(dir: &TempDir) -> Arc<Datastore> {
    let store = Datastore::open_or_create(test_config(dir)).unwrap();
    if !store.bucket_exists("b") {
        store
            .create_bucket(BucketInput::new("b", "currentwindow", "aw-watcher-window", "host"))
            .unwrap();
    }
    Arc::new(store)
}

/// Counts reads so tests can tell whether the cache answered.
struct CountingStore {
    inner: Arc<Datastore>,
    reads: AtomicUsize,
}

impl CountingStore {
    fn new(inner: Arc<Datastore>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl EventStore for CountingStore {
    fn bucket_exists(&self, bucket_id: &str) -> bool {
        self.inner.bucket_exists(bucket_id)
    }

    fn get_events(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_events(bucket_id, query)
    }

    fn insert_event(&self, bucket_id: &str, event: Event) -> Result<Event> {
        self.inner.insert_event(bucket_id, event)
    }

    fn replace_event(&self, bucket_id: &str, id: EventId, event: Event) -> Result<Event> {
        self.inner.replace_event(bucket_id, id, event)
    }
}

fn counting_handler(
    dir: &TempDir,
    now: i64,
) -> (HeartbeatHandler<CountingStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(at(now)));
    let store = Arc::new(CountingStore::new(open_store(dir)));
    let cache = LastEventCache::with_clock(CacheConfig::default(), clock.clone());
    (HeartbeatHandler::new(store, cache), clock)
}

#[test]
fn test_merge_insert_sequence() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (handler, _clock) = counting_handler(&dir, 100);
    let pulse = Duration::seconds(5);

    let first = handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    assert_eq!(first.timestamp, at(100));
    assert_eq!(first.duration, Duration::zero());
    assert_eq!(first.data, app("X"));

    let merged = handler.heartbeat("b", Event::heartbeat(at(103), app("X")), pulse).unwrap();
    assert_eq!(merged.id, first.id);
    assert_eq!(merged.timestamp, at(100));
    assert_eq!(merged.duration, Duration::seconds(3));

    let split = handler.heartbeat("b", Event::heartbeat(at(110), app("X")), pulse).unwrap();
    assert_ne!(split.id, first.id);
    assert_eq!(split.timestamp, at(110));
    assert_eq!(split.duration, Duration::zero());

    let events = handler.store().get_events("b", &EventQuery::all()).unwrap();
    assert_eq!(events, vec![split, merged]);
}

#[test]
fn test_same_results_when_cache_entries_are_stale() {
    // A system clock makes every 1970 timestamp stale, so every lookup
    // falls through to the store; results must not change.
    let dir = TempDir::new().unwrap();
    let handler = HeartbeatHandler::new(open_store(&dir), LastEventCache::new(CacheConfig::default()));
    let pulse = Duration::seconds(5);

    handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    let merged = handler.heartbeat("b", Event::heartbeat(at(103), app("X")), pulse).unwrap();
    let split = handler.heartbeat("b", Event::heartbeat(at(110), app("X")), pulse).unwrap();

    assert_eq!(merged.duration, Duration::seconds(3));
    assert_eq!(split.timestamp, at(110));
    assert_eq!(handler.store().get_events("b", &EventQuery::all()).unwrap().len(), 2);
}

#[test]
fn test_merge_within_window_replaces_single_event() {
    let dir = TempDir::new().unwrap();
    let (handler, _clock) = counting_handler(&dir, 100);
    let pulse = Duration::seconds(10);

    handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    for secs in [105, 103, 112, 120, 121] {
        handler.heartbeat("b", Event::heartbeat(at(secs), app("X")), pulse).unwrap();
    }

    let events = handler.store().get_events("b", &EventQuery::all()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].timestamp, at(100));
    assert_eq!(events[0].duration, Duration::seconds(21));
}

#[test]
fn test_cache_hit_avoids_store_reads() {
    let dir = TempDir::new().unwrap();
    let (handler, _clock) = counting_handler(&dir, 100);
    let pulse = Duration::seconds(5);

    handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    assert_eq!(handler.store().reads(), 1);

    for secs in 101..=110 {
        handler.heartbeat("b", Event::heartbeat(at(secs), app("X")), pulse).unwrap();
    }
    assert_eq!(handler.store().reads(), 1);
}

#[test]
fn test_out_of_order_heartbeat_reads_store_and_keeps_cache() {
    let dir = TempDir::new().unwrap();
    let (handler, _clock) = counting_handler(&dir, 100);
    let pulse = Duration::seconds(5);

    let early = handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    let late = handler.heartbeat("b", Event::heartbeat(at(200), app("Y")), pulse).unwrap();
    let reads_before = handler.store().reads();

    // The cached t=200 event is newer than t=150.
    let fetched = handler.cache().with_bucket("b", |slot| {
        slot.fetch_last_event(&**handler.store(), at(150)).unwrap()
    });
    assert_eq!(fetched, Some(early));
    assert_eq!(handler.store().reads(), reads_before + 1);
    assert_eq!(handler.cache().peek("b"), Some(late));
}

#[test]
fn test_stale_entry_replaced_by_store_read() {
    let dir = TempDir::new().unwrap();
    let (handler, clock) = counting_handler(&dir, 100);
    let pulse = Duration::seconds(5);

    handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
    handler.heartbeat("b", Event::heartbeat(at(102), app("X")), pulse).unwrap();
    assert_eq!(handler.store().reads(), 1);

    // The cached event ends at 102; at 163 it is more than 60s old.
    clock.set(at(163));
    let later = handler.heartbeat("b", Event::heartbeat(at(163), app("X")), pulse).unwrap();
    assert_eq!(handler.store().reads(), 2);
    assert_eq!(later.timestamp, at(163));
    assert_eq!(handler.cache().peek("b"), Some(later));
}

#[test]
fn test_cold_cache_after_reopen_merges_into_persisted_event() {
    let dir = TempDir::new().unwrap();
    let pulse = Duration::seconds(5);

    let first_id = {
        let (handler, _clock) = counting_handler(&dir, 100);
        handler.heartbeat("b", Event::heartbeat(at(100), app("X")), pulse).unwrap();
        let merged = handler.heartbeat("b", Event::heartbeat(at(102), app("X")), pulse).unwrap();
        merged.id
    };

    let (handler, _clock) = counting_handler(&dir, 100);
    let merged = handler.heartbeat("b", Event::heartbeat(at(104), app("X")), pulse).unwrap();
    assert_eq!(merged.id, first_id);
    assert_eq!(merged.duration, Duration::seconds(4));
    assert_eq!(handler.store().reads(), 1);

    let events = handler.store().get_events("b", &EventQuery::all()).unwrap();
    assert_eq!(events.len(), 1);
}
