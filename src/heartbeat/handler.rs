//! Heartbeat handling: cache lookup, merge decision, store write, cache update.

use super::cache::{LastEventCache, LastEventSource};
use super::merge::heartbeat_merge;
use crate::error::{Result, StoreError};
use crate::store::EventStore;
use crate::types::Event;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

/// Collapses heartbeats into stored events.
///
/// Heartbeats for the same bucket are processed one at a time; heartbeats
/// for different buckets run in parallel.
pub struct HeartbeatHandler<S> {
    store: Arc<S>,
    cache: LastEventCache,
}

impl<S: EventStore> HeartbeatHandler<S> {
    pub fn new(store: Arc<S>, cache: LastEventCache) -> Self {
        Self { store, cache }
    }

    /// Merge `heartbeat` into the bucket's last event, or insert it as a new
    /// event. Returns the event that is now authoritative for the bucket.
    ///
    /// The bucket must already exist.
    pub fn heartbeat(&self, bucket_id: &str, heartbeat: Event, pulsetime: Duration) -> Result<Event> {
        let store: &dyn EventStore = &*self.store;
        self.cache.with_bucket(bucket_id, |slot| {
            process_heartbeat(slot, store, bucket_id, heartbeat, pulsetime)
        })
    }

    pub fn cache(&self) -> &LastEventCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

/// One heartbeat against an already locked last-event source.
///
/// Performs exactly one store write. The source is updated only after that
/// write succeeded.
pub fn process_heartbeat(
    source: &mut impl LastEventSource,
    store: &dyn EventStore,
    bucket_id: &str,
    heartbeat: Event,
    pulsetime: Duration,
) -> Result<Event> {
    debug!(
        bucket = bucket_id,
        timestamp = %heartbeat.timestamp,
        data = ?heartbeat.data,
        "received heartbeat"
    );

    match source.fetch_last_event(store, heartbeat.timestamp)? {
        Some(last) if last.data == heartbeat.data => {
            if let Some(merged) = heartbeat_merge(&last, &heartbeat, pulsetime) {
                let id = last.id.ok_or_else(|| {
                    StoreError::InvalidOperation("last event has no id".into())
                })?;
                debug!(bucket = bucket_id, %id, "received valid heartbeat, merging");
                let stored = store.replace_event(bucket_id, id, merged)?;
                source.set_last_event(stored.clone());
                return Ok(stored);
            }
            info!(
                bucket = bucket_id,
                "received heartbeat after pulse window, inserting as new event"
            );
        }
        Some(_) => {
            debug!(
                bucket = bucket_id,
                "received heartbeat with differing data, inserting as new event"
            );
        }
        None => {
            info!(
                bucket = bucket_id,
                "received heartbeat, but bucket was previously empty, inserting as new event"
            );
        }
    }

    let stored = store.insert_event(bucket_id, heartbeat)?;
    source.set_last_event(stored.clone());
    Ok(stored)
}
