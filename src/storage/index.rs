//! In-memory bucket index.

use crate::error::{Result, StoreError};
use crate::types::{BucketMetadata, Event, EventId, EventQuery};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Events of a single bucket, ordered by (timestamp, id).
struct BucketEntry {
    metadata: BucketMetadata,

    events: BTreeMap<(DateTime<Utc>, EventId), Event>,

    /// Event ID to its current timestamp (the other half of the ordering key).
    positions: HashMap<EventId, DateTime<Utc>>,
}

impl BucketEntry {
    fn new(metadata: BucketMetadata) -> Self {
        Self {
            metadata,
            events: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }

    fn put(&mut self, id: EventId, event: Event) {
        if let Some(old) = self.positions.insert(id, event.timestamp) {
            self.events.remove(&(old, id));
        }
        self.events.insert((event.timestamp, id), event);
    }

    fn latest(&self) -> Option<&Event> {
        self.events.values().next_back()
    }
}

/// Index of all buckets and their events.
pub struct BucketIndex {
    buckets: RwLock<HashMap<String, BucketEntry>>,
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketIndex {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Add a bucket.
    pub fn create_bucket(&self, metadata: BucketMetadata) -> Result<()> {
        let mut buckets = self.buckets.write();
        if buckets.contains_key(&metadata.id) {
            return Err(StoreError::BucketExists(metadata.id));
        }
        buckets.insert(metadata.id.clone(), BucketEntry::new(metadata));
        Ok(())
    }

    /// Remove a bucket and all of its events.
    pub fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        self.buckets
            .write()
            .remove(bucket_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchBucket(bucket_id.to_string()))
    }

    pub fn contains(&self, bucket_id: &str) -> bool {
        self.buckets.read().contains_key(bucket_id)
    }

    /// Bucket metadata with `last_updated` filled in.
    pub fn metadata(&self, bucket_id: &str) -> Option<BucketMetadata> {
        self.buckets.read().get(bucket_id).map(Self::describe)
    }

    /// Metadata of every bucket.
    pub fn list(&self) -> Vec<BucketMetadata> {
        self.buckets.read().values().map(Self::describe).collect()
    }

    fn describe(entry: &BucketEntry) -> BucketMetadata {
        let mut metadata = entry.metadata.clone();
        metadata.last_updated = entry.latest().map(Event::end);
        metadata
    }

    /// Add an event. The event must carry an id; an existing id is overwritten.
    pub fn insert(&self, bucket_id: &str, event: Event) -> Result<()> {
        let id = event
            .id
            .ok_or_else(|| StoreError::InvalidOperation("indexed event has no id".into()))?;
        let mut buckets = self.buckets.write();
        let entry = buckets
            .get_mut(bucket_id)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket_id.to_string()))?;
        entry.put(id, event);
        Ok(())
    }

    /// Overwrite an existing event by id, re-keying it by its new timestamp.
    pub fn replace(&self, bucket_id: &str, id: EventId, mut event: Event) -> Result<()> {
        let mut buckets = self.buckets.write();
        let entry = buckets
            .get_mut(bucket_id)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket_id.to_string()))?;
        if !entry.positions.contains_key(&id) {
            return Err(StoreError::EventNotFound {
                bucket: bucket_id.to_string(),
                id,
            });
        }
        event.id = Some(id);
        entry.put(id, event);
        Ok(())
    }

    /// Whether the bucket holds an event with this id.
    pub fn contains_event(&self, bucket_id: &str, id: EventId) -> bool {
        self.buckets
            .read()
            .get(bucket_id)
            .map_or(false, |entry| entry.positions.contains_key(&id))
    }

    /// Events matching `query`, most recent first.
    pub fn get(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        let buckets = self.buckets.read();
        let entry = buckets
            .get(bucket_id)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket_id.to_string()))?;

        let lower = match query.start {
            Some(start) => Bound::Included((start, EventId(0))),
            None => Bound::Unbounded,
        };
        let upper = match query.end {
            Some(end) => Bound::Included((end, EventId(u64::MAX))),
            None => Bound::Unbounded,
        };
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Ok(Vec::new());
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(entry
            .events
            .range((lower, upper))
            .rev()
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    /// Number of events in a bucket.
    pub fn event_count(&self, bucket_id: &str) -> Option<usize> {
        self.buckets.read().get(bucket_id).map(|e| e.events.len())
    }

    /// Number of buckets and total number of events.
    pub fn counts(&self) -> (usize, usize) {
        let buckets = self.buckets.read();
        let events = buckets.values().map(|e| e.events.len()).sum();
        (buckets.len(), events)
    }

    /// Highest event id across all buckets.
    pub fn max_event_id(&self) -> Option<EventId> {
        self.buckets
            .read()
            .values()
            .filter_map(|e| e.positions.keys().max().copied())
            .max()
    }
}
