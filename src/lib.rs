//! # Heartbeat Store
//!
//! Storage and ingestion for activity tracking. Watchers report heartbeats,
//! zero-duration observations such as "window X is focused", and the store
//! collapses runs of identical heartbeats into single events with extended
//! durations.
//!
//! ## Core Concepts
//!
//! - **Buckets**: Independent event streams, one per watcher
//! - **Events**: Timestamped observations with a duration and a data map
//! - **Heartbeats**: Zero-duration events merged into the bucket's last event
//!   when their data matches and they arrive within the pulse window
//! - **Last-event cache**: Per-bucket cache that spares the store a read on
//!   every heartbeat
//!
//! ## Example
//!
//! ```ignore
//! use heartbeat_store::{ApiConfig, BucketInput, Datastore, Event, ServerApi, StoreConfig};
//!
//! let store = Datastore::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//! let api = ServerApi::new(Arc::new(store), ApiConfig::default());
//!
//! api.create_bucket(BucketInput::new("aw-watcher-window", "currentwindow", "watcher", "laptop"))?;
//!
//! // Heartbeats within 5 seconds of each other extend the same event
//! let event = api.heartbeat("aw-watcher-window", Event::heartbeat(Utc::now(), data), 5.0)?;
//! ```

pub mod api;
pub mod clock;
pub mod error;
pub mod heartbeat;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use api::{ApiConfig, ServerApi, ServerInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use heartbeat::{
    heartbeat_merge, process_heartbeat, BucketSlot, CacheConfig, HeartbeatHandler,
    LastEventCache, LastEventSource,
};
pub use storage::{BucketIndex, EventLog, LogEntry};
pub use store::{Datastore, EventStore, StoreConfig};
pub use types::*;
