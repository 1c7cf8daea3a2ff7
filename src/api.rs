//! In-process server API over a [`Datastore`].
//!
//! Bucket-scoped calls check that the bucket exists before doing anything
//! else and validate incoming events, so the heartbeat path only ever sees
//! well-formed input for a live bucket.

use crate::error::{Result, StoreError};
use crate::heartbeat::{CacheConfig, HeartbeatHandler, LastEventCache};
use crate::store::{Datastore, EventStore};
use crate::types::{duration_from_secs, BucketInput, BucketMetadata, Event, EventQuery};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// API configuration.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Testing mode; bucket deletion is only allowed here.
    pub testing: bool,

    /// Hostname reported by [`ServerApi::get_info`].
    pub hostname: String,

    pub cache: CacheConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            testing: false,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            cache: CacheConfig::default(),
        }
    }
}

/// Server information.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub version: String,
    pub testing: bool,
}

/// Bucket and event operations, plus heartbeats.
pub struct ServerApi {
    store: Arc<Datastore>,
    heartbeats: HeartbeatHandler<Datastore>,
    testing: bool,
    hostname: String,
}

impl ServerApi {
    pub fn new(store: Arc<Datastore>, config: ApiConfig) -> Self {
        Self::with_cache(store, LastEventCache::new(config.cache.clone()), config)
    }

    /// Use a pre-built cache (e.g. one with a manual clock).
    pub fn with_cache(store: Arc<Datastore>, cache: LastEventCache, config: ApiConfig) -> Self {
        Self {
            heartbeats: HeartbeatHandler::new(Arc::clone(&store), cache),
            store,
            testing: config.testing,
            hostname: config.hostname,
        }
    }

    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    pub fn heartbeats(&self) -> &HeartbeatHandler<Datastore> {
        &self.heartbeats
    }

    fn check_bucket_exists(&self, bucket_id: &str) -> Result<()> {
        if self.store.bucket_exists(bucket_id) {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket(bucket_id.to_string()))
        }
    }

    /// Server info.
    pub fn get_info(&self) -> ServerInfo {
        ServerInfo {
            hostname: self.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            testing: self.testing,
        }
    }

    /// All buckets by id, with `last_updated` set for non-empty buckets.
    pub fn get_buckets(&self) -> BTreeMap<String, BucketMetadata> {
        debug!("received get request for buckets");
        self.store
            .buckets()
            .into_iter()
            .map(|bucket| (bucket.id.clone(), bucket))
            .collect()
    }

    pub fn get_bucket_metadata(&self, bucket_id: &str) -> Result<BucketMetadata> {
        self.check_bucket_exists(bucket_id)?;
        self.store.bucket_metadata(bucket_id)
    }

    pub fn create_bucket(&self, input: BucketInput) -> Result<()> {
        self.store.create_bucket(input).map(|_| ())
    }

    /// Delete a bucket. Only permitted in testing mode.
    pub fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        self.check_bucket_exists(bucket_id)?;
        if !self.testing {
            return Err(StoreError::PermissionDenied(
                "deleting buckets is only permitted when running in testing mode".into(),
            ));
        }

        // Hold the bucket's slot so no heartbeat interleaves with the delete.
        self.heartbeats.cache().with_bucket(bucket_id, |slot| {
            self.store.delete_bucket(bucket_id)?;
            slot.remove();
            Ok(())
        })
    }

    pub fn get_events(&self, bucket_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        self.check_bucket_exists(bucket_id)?;
        debug!(bucket = bucket_id, "received get request for events");
        self.store.get_events(bucket_id, query)
    }

    /// Insert events. Returns the inserted event when exactly one was given.
    pub fn create_events(&self, bucket_id: &str, events: Vec<Event>) -> Result<Option<Event>> {
        self.check_bucket_exists(bucket_id)?;
        for event in &events {
            event.validate()?;
        }

        let single = events.len() == 1;
        let inserted = self.store.insert_events(bucket_id, events)?;
        Ok(if single { inserted.into_iter().next() } else { None })
    }

    /// Submit a heartbeat with a pulse window given in seconds.
    pub fn heartbeat(&self, bucket_id: &str, heartbeat: Event, pulsetime: f64) -> Result<Event> {
        self.check_bucket_exists(bucket_id)?;
        heartbeat.validate()?;
        let pulsetime = duration_from_secs(pulsetime)?;
        self.heartbeats.heartbeat(bucket_id, heartbeat, pulsetime)
    }
}
