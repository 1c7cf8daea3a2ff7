//! Core types for the heartbeat store.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event payload: a mapping from string keys to arbitrary JSON values.
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for an event (assigned by store).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EventId {
    /// The following id, or `None` past `u64::MAX`.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(EventId)
    }
}

/// A timestamped observation with a non-negative duration.
///
/// A heartbeat is an `Event` whose duration is zero at submission time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier (assigned by store, absent before insert).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,

    /// When the observed state started.
    pub timestamp: DateTime<Utc>,

    /// How long the state lasted, serialized as float seconds.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Application-defined payload.
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    /// Create a new event without an id.
    pub fn new(timestamp: DateTime<Utc>, duration: Duration, data: EventData) -> Self {
        Self {
            id: None,
            timestamp,
            duration,
            data,
        }
    }

    /// Create a zero-duration heartbeat.
    pub fn heartbeat(timestamp: DateTime<Utc>, data: EventData) -> Self {
        Self::new(timestamp, Duration::zero(), data)
    }

    /// Set the id.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// The instant the event ends (`timestamp + duration`), saturating at
    /// the latest representable instant.
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Reject events that could not have been observed.
    pub fn validate(&self) -> Result<()> {
        if self.duration < Duration::zero() {
            return Err(StoreError::InvalidEvent(format!(
                "negative duration: {}",
                self.duration
            )));
        }
        if self.timestamp.checked_add_signed(self.duration).is_none() {
            return Err(StoreError::InvalidEvent(format!(
                "event starting at {} cannot last {}",
                self.timestamp, self.duration
            )));
        }
        Ok(())
    }

    /// Drop sub-microsecond precision, which the log does not keep.
    pub fn truncate_to_micros(mut self) -> Self {
        self.timestamp = self.timestamp.trunc_subsecs(6);
        self.duration = match self.duration.num_microseconds() {
            Some(micros) => Duration::microseconds(micros),
            None => Duration::milliseconds(self.duration.num_milliseconds()),
        };
        self
    }
}

/// Convert float seconds to a duration with microsecond precision.
pub fn duration_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(StoreError::InvalidEvent(format!(
            "duration must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    let micros = (secs * 1_000_000.0).round();
    if micros >= i64::MAX as f64 {
        return Err(StoreError::InvalidEvent(format!(
            "duration of {} seconds is out of range",
            secs
        )));
    }
    Ok(Duration::microseconds(micros as i64))
}

/// Convert a duration to float seconds.
pub fn duration_to_secs(duration: Duration) -> f64 {
    match duration.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => duration.num_milliseconds() as f64 / 1_000.0,
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(super::duration_to_secs(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        super::duration_from_secs(secs).map_err(D::Error::custom)
    }
}

/// Input for creating a bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketInput {
    pub id: String,
    pub event_type: String,
    pub client: String,
    pub hostname: String,
}

impl BucketInput {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        client: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            client: client.into(),
            hostname: hostname.into(),
        }
    }
}

/// Bucket metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketMetadata {
    pub id: String,
    pub event_type: String,
    pub client: String,
    pub hostname: String,
    pub created: DateTime<Utc>,

    /// End of the latest event; derived on read, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl BucketMetadata {
    pub fn from_input(input: BucketInput, created: DateTime<Utc>) -> Self {
        Self {
            id: input.id,
            event_type: input.event_type,
            client: input.client,
            hostname: input.hostname,
            created,
            last_updated: None,
        }
    }
}

/// Bounds for reading events from a bucket.
///
/// `start` and `end` bound the event timestamp inclusively. Results are
/// returned most recent first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventQuery {
    pub limit: Option<usize>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EventQuery {
    /// All events in the bucket.
    pub fn all() -> Self {
        Self::default()
    }

    /// The single event at or immediately preceding `at`.
    pub fn latest_at(at: DateTime<Utc>) -> Self {
        Self {
            limit: Some(1),
            start: None,
            end: Some(at),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub bucket_count: u64,
    pub event_count: u64,
    pub log_size_bytes: u64,
}
