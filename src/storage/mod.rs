//! Event storage.
//!
//! Mutations are appended to a checksummed log and applied to an in-memory
//! index of buckets, each holding its events ordered by timestamp.

mod index;
mod log;

pub use index::BucketIndex;
pub use log::{EventLog, LogEntry};
