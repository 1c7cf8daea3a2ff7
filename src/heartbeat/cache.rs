//! Per-bucket cache of the most recently written event.
//!
//! Each bucket gets one slot behind its own mutex. Holding that mutex is
//! what serializes heartbeats for a bucket: the whole fetch, merge, write
//! and cache update sequence runs inside [`LastEventCache::with_bucket`].
//! Buckets never contend with each other beyond the brief map lookup.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::EventStore;
use crate::types::{Event, EventQuery};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Cached entries whose end is older than this are dropped on lookup.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 60;

/// Last-event cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// When false every lookup reads the store and nothing is cached.
    pub enabled: bool,

    /// How far behind wall-clock time a cached event may end before it is
    /// evicted.
    pub stale_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Where the heartbeat path gets its candidate last event from.
pub trait LastEventSource {
    /// The event a heartbeat at `as_of` should be merged against, if any.
    fn fetch_last_event(
        &mut self,
        store: &dyn EventStore,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Event>>;

    /// Record the event that is now authoritative for the bucket.
    fn set_last_event(&mut self, event: Event);
}

type Slot = Arc<Mutex<Option<Event>>>;

/// Process-wide cache of the last event per bucket.
pub struct LastEventCache {
    slots: RwLock<HashMap<String, Slot>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl LastEventCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn slot(&self, bucket_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(bucket_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(bucket_id.to_string()).or_default())
    }

    fn is_current(&self, bucket_id: &str, slot: &Slot) -> bool {
        self.slots
            .read()
            .get(bucket_id)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
    }

    /// Run `f` with exclusive access to the bucket's slot.
    pub fn with_bucket<R>(&self, bucket_id: &str, f: impl FnOnce(&mut BucketSlot<'_>) -> R) -> R {
        loop {
            let slot = self.slot(bucket_id);
            let mut entry = slot.lock();
            // Removed while we waited for it; the bucket gets a fresh slot.
            if !self.is_current(bucket_id, &slot) {
                continue;
            }

            let mut bucket = BucketSlot {
                bucket_id,
                entry: &mut *entry,
                config: &self.config,
                clock: &*self.clock,
                remove: false,
            };
            let result = f(&mut bucket);

            // Still holding the slot, so no waiter can use it after this.
            if bucket.remove {
                self.slots.write().remove(bucket_id);
            }
            return result;
        }
    }

    /// Number of buckets with a slot.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the cached event for a bucket.
    pub fn evict(&self, bucket_id: &str) {
        let slot = self.slots.read().get(bucket_id).cloned();
        if let Some(slot) = slot {
            *slot.lock() = None;
        }
    }

    /// Drop every cached event.
    pub fn clear(&self) {
        let slots: Vec<Slot> = self.slots.read().values().cloned().collect();
        for slot in slots {
            *slot.lock() = None;
        }
    }

    /// The cached event for a bucket, without any staleness checks.
    pub fn peek(&self, bucket_id: &str) -> Option<Event> {
        let slot = self.slots.read().get(bucket_id).cloned()?;
        let entry = slot.lock();
        entry.clone()
    }
}

enum Lookup {
    Miss,
    Stale,
    Newer,
    Hit(Event),
}

/// A locked cache slot for one bucket.
pub struct BucketSlot<'a> {
    bucket_id: &'a str,
    entry: &'a mut Option<Event>,
    config: &'a CacheConfig,
    clock: &'a dyn Clock,
    remove: bool,
}

impl BucketSlot<'_> {
    pub fn bucket_id(&self) -> &str {
        self.bucket_id
    }

    /// Drop the cached event.
    pub fn evict(&mut self) {
        *self.entry = None;
    }

    /// Drop the cached event and release the slot itself once `with_bucket`
    /// returns. Used when the bucket is deleted.
    pub fn remove(&mut self) {
        self.evict();
        self.remove = true;
    }

    fn lookup(&self, as_of: DateTime<Utc>) -> Lookup {
        if !self.config.enabled {
            return Lookup::Miss;
        }
        match self.entry.as_ref() {
            None => Lookup::Miss,
            Some(cached) if cached.end() < self.clock.now() - self.config.stale_after => {
                Lookup::Stale
            }
            Some(cached) if cached.timestamp > as_of => Lookup::Newer,
            Some(cached) => Lookup::Hit(cached.clone()),
        }
    }
}

impl LastEventSource for BucketSlot<'_> {
    fn fetch_last_event(
        &mut self,
        store: &dyn EventStore,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        match self.lookup(as_of) {
            Lookup::Hit(event) => {
                debug!(bucket = self.bucket_id, "used the cache");
                return Ok(Some(event));
            }
            Lookup::Stale => {
                debug!(bucket = self.bucket_id, "last event was too old, dropping from cache");
                self.evict();
            }
            // Kept: a later heartbeat may still be valid against it.
            Lookup::Newer => {
                debug!(bucket = self.bucket_id, "last event did not pass timestamp constraint");
            }
            Lookup::Miss => {}
        }

        let last = store
            .get_events(self.bucket_id, &EventQuery::latest_at(as_of))?
            .into_iter()
            .next();
        debug!(bucket = self.bucket_id, "didn't use the cache");
        Ok(last)
    }

    fn set_last_event(&mut self, event: Event) {
        if self.config.enabled {
            *self.entry = Some(event);
        }
    }
}
