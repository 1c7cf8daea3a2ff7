//! Heartbeat reduction.
//!
//! Clients report zero-duration heartbeats describing their current state.
//! A heartbeat whose data equals the bucket's last event and which arrives
//! within the pulse window extends that event; anything else becomes a new
//! event.
//!
//! - [`merge`]: the pure merge decision.
//! - [`cache`]: per-bucket last-event cache, which also serializes
//!   heartbeats per bucket.
//! - [`handler`]: ties the two to an [`EventStore`](crate::EventStore).
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(Datastore::in_memory());
//! store.create_bucket(BucketInput::new("aw-watcher-window", "currentwindow", "watcher", "laptop"))?;
//!
//! let handler = HeartbeatHandler::new(store, LastEventCache::new(CacheConfig::default()));
//! let event = handler.heartbeat("aw-watcher-window", heartbeat, Duration::seconds(5))?;
//! ```

pub mod cache;
pub mod handler;
pub mod merge;

pub use cache::{BucketSlot, CacheConfig, LastEventCache, LastEventSource, DEFAULT_STALE_AFTER_SECS};
pub use handler::{process_heartbeat, HeartbeatHandler};
pub use merge::heartbeat_merge;
