//! The event store: the `EventStore` seam and the file-backed `Datastore`.

use crate::error::{Result, StoreError};
use crate::storage::{BucketIndex, EventLog, LogEntry};
use crate::types::{BucketInput, BucketMetadata, Event, EventId, EventQuery, StoreStats};
use chrono::Utc;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read and write operations the heartbeat path requires of a store.
pub trait EventStore: Send + Sync {
    /// Whether a bucket with this id exists.
    fn bucket_exists(&self, bucket_id: &str) -> bool;

    /// Events matching `query`, most recent first.
    fn get_events(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>>;

    /// Insert an event, assigning an id if it has none.
    fn insert_event(&self, bucket_id: &str, event: Event) -> Result<Event>;

    /// Overwrite the event with the given id.
    fn replace_event(&self, bucket_id: &str, id: EventId, event: Event) -> Result<Event>;
}

impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    fn bucket_exists(&self, bucket_id: &str) -> bool {
        (**self).bucket_exists(bucket_id)
    }

    fn get_events(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        (**self).get_events(bucket_id, query)
    }

    fn insert_event(&self, bucket_id: &str, event: Event) -> Result<Event> {
        (**self).insert_event(bucket_id, event)
    }

    fn replace_event(&self, bucket_id: &str, id: EventId, event: Event) -> Result<Event> {
        (**self).replace_event(bucket_id, id, event)
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log to disk every N writes.
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./heartbeat-store"),
            create_if_missing: true,
            sync_interval: EventLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"HBS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Name of the log file inside the store directory.
const LOG_FILE: &str = "events.log";

/// Bucketed event store.
///
/// Every mutation is appended to the log before it is applied to the
/// in-memory index, so a failed write leaves the visible state unchanged.
/// An in-memory store skips the log entirely.
pub struct Datastore {
    /// Base path, if file-backed.
    path: Option<PathBuf>,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    /// Mutation log, if file-backed.
    log: Option<EventLog>,

    /// Bucket and event index.
    index: BucketIndex,

    /// Next event id to assign.
    next_id: AtomicU64,

    /// Serializes log append + index update.
    write_lock: Mutex<()>,
}

impl Datastore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::write_manifest(&config.path)?;

        let log = EventLog::open_with_sync_interval(
            config.path.join(LOG_FILE),
            config.sync_interval,
        )?;

        info!(path = %config.path.display(), "created event store");
        let store = Self::from_parts(Some(config.path), Some(lock_file), Some(log));
        store.rebuild()?;
        Ok(store)
    }

    /// Open an existing store, replaying its log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = EventLog::open_with_sync_interval(
            config.path.join(LOG_FILE),
            config.sync_interval,
        )?;

        let store = Self::from_parts(Some(config.path), Some(lock_file), Some(log));
        store.rebuild()?;

        let (buckets, events) = store.index.counts();
        info!(
            path = ?store.path,
            buckets,
            events,
            "opened event store"
        );
        Ok(store)
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::from_parts(None, None, None)
    }

    fn from_parts(path: Option<PathBuf>, lock_file: Option<File>, log: Option<EventLog>) -> Self {
        Self {
            path,
            _lock_file: lock_file,
            log,
            index: BucketIndex::new(),
            next_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Replay the log into the index.
    fn rebuild(&self) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };

        // Ids of deleted buckets are never reused.
        let mut max_id = EventId(0);
        for (offset, entry) in log.replay()? {
            if let LogEntry::InsertEvent {
                event: Event { id: Some(id), .. },
                ..
            } = &entry
            {
                max_id = max_id.max(*id);
            }
            Self::apply(&self.index, entry).map_err(|e| {
                StoreError::Corruption(format!("replaying log entry at offset {}: {}", offset, e))
            })?;
        }

        let live_max = self.index.max_event_id().unwrap_or(EventId(0));
        let next = max_id.max(live_max).next().ok_or_else(|| {
            StoreError::Corruption(format!("log holds the largest event id {}", max_id))
        })?;
        self.next_id.store(next.0, Ordering::SeqCst);
        Ok(())
    }

    fn apply(index: &BucketIndex, entry: LogEntry) -> Result<()> {
        match entry {
            LogEntry::CreateBucket(metadata) => index.create_bucket(metadata),
            LogEntry::DeleteBucket { bucket_id } => index.delete_bucket(&bucket_id),
            LogEntry::InsertEvent { bucket_id, event } => index.insert(&bucket_id, event),
            LogEntry::ReplaceEvent { bucket_id, event } => {
                let id = event.id.ok_or_else(|| {
                    StoreError::InvalidOperation("replaced event has no id".into())
                })?;
                index.replace(&bucket_id, id, event)
            }
        }
    }

    /// Log first, then index.
    fn commit(&self, entry: LogEntry) -> Result<()> {
        if let Some(log) = &self.log {
            log.append(&entry)?;
        }
        Self::apply(&self.index, entry)
    }

    fn require_bucket(&self, bucket_id: &str) -> Result<()> {
        if self.index.contains(bucket_id) {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket(bucket_id.to_string()))
        }
    }

    // --- Bucket Operations ---

    /// Create a bucket.
    pub fn create_bucket(&self, input: BucketInput) -> Result<BucketMetadata> {
        let _lock = self.write_lock.lock();

        if self.index.contains(&input.id) {
            return Err(StoreError::BucketExists(input.id));
        }

        let metadata = BucketMetadata::from_input(input, Utc::now());
        self.commit(LogEntry::CreateBucket(metadata.clone()))?;

        info!(bucket = %metadata.id, event_type = %metadata.event_type, "created bucket");
        Ok(metadata)
    }

    /// Delete a bucket and all of its events.
    pub fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        let _lock = self.write_lock.lock();

        self.require_bucket(bucket_id)?;
        self.commit(LogEntry::DeleteBucket {
            bucket_id: bucket_id.to_string(),
        })?;

        info!(bucket = bucket_id, "deleted bucket");
        Ok(())
    }

    /// Metadata of every bucket.
    pub fn buckets(&self) -> Vec<BucketMetadata> {
        self.index.list()
    }

    /// Metadata of one bucket.
    pub fn bucket_metadata(&self, bucket_id: &str) -> Result<BucketMetadata> {
        self.index
            .metadata(bucket_id)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket_id.to_string()))
    }

    // --- Event Operations ---

    /// Insert several events, returning them with their ids.
    pub fn insert_events(&self, bucket_id: &str, events: Vec<Event>) -> Result<Vec<Event>> {
        let _lock = self.write_lock.lock();

        self.require_bucket(bucket_id)?;
        events
            .into_iter()
            .map(|event| self.insert_locked(bucket_id, event))
            .collect()
    }

    fn insert_locked(&self, bucket_id: &str, event: Event) -> Result<Event> {
        self.require_bucket(bucket_id)?;

        let mut event = event.truncate_to_micros();
        let id = match event.id {
            Some(id) => {
                let next = id.next().ok_or_else(|| {
                    StoreError::InvalidEvent(format!("event id {} is out of range", id))
                })?;
                self.next_id.fetch_max(next.0, Ordering::SeqCst);
                id
            }
            None => self
                .next_id
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .map(EventId)
                .map_err(|_| StoreError::InvalidOperation("event ids exhausted".into()))?,
        };
        event.id = Some(id);

        self.commit(LogEntry::InsertEvent {
            bucket_id: bucket_id.to_string(),
            event: event.clone(),
        })?;

        debug!(bucket = bucket_id, %id, "inserted event");
        Ok(event)
    }

    // --- Maintenance ---

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        let (buckets, events) = self.index.counts();
        StoreStats {
            bucket_count: buckets as u64,
            event_count: events as u64,
            log_size_bytes: self.log.as_ref().map_or(0, EventLog::size),
        }
    }

    /// Flush the log to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.log {
            Some(log) => log.sync(),
            None => Ok(()),
        }
    }

    /// Base path, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl EventStore for Datastore {
    fn bucket_exists(&self, bucket_id: &str) -> bool {
        self.index.contains(bucket_id)
    }

    fn get_events(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        self.index.get(bucket_id, query)
    }

    fn insert_event(&self, bucket_id: &str, event: Event) -> Result<Event> {
        let _lock = self.write_lock.lock();
        self.insert_locked(bucket_id, event)
    }

    fn replace_event(&self, bucket_id: &str, id: EventId, event: Event) -> Result<Event> {
        let _lock = self.write_lock.lock();
        let mut event = event.truncate_to_micros();

        self.require_bucket(bucket_id)?;
        if !self.index.contains_event(bucket_id, id) {
            return Err(StoreError::EventNotFound {
                bucket: bucket_id.to_string(),
                id,
            });
        }
        event.id = Some(id);

        self.commit(LogEntry::ReplaceEvent {
            bucket_id: bucket_id.to_string(),
            event: event.clone(),
        })?;

        debug!(bucket = bucket_id, %id, "replaced event");
        Ok(event)
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(error = %e, "failed to sync event log on drop");
        }
    }
}
