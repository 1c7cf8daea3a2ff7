//! Heartbeat merging.

use crate::types::Event;
use chrono::Duration;

/// Try to extend `last_event` so that it covers `heartbeat`.
///
/// The caller must have checked that both carry the same data. Returns
/// `None` when the heartbeat starts more than `pulsetime` past the end of
/// `last_event`. The merged event keeps the id, start and data of
/// `last_event`; only its duration can grow, up to the end of the heartbeat.
pub fn heartbeat_merge(last_event: &Event, heartbeat: &Event, pulsetime: Duration) -> Option<Event> {
    let last_end = last_event.end();
    // A window reaching past the last representable instant covers everything.
    if let Some(window_end) = last_end.checked_add_signed(pulsetime) {
        if heartbeat.timestamp > window_end {
            return None;
        }
    }

    let end = last_end.max(heartbeat.end());
    Some(Event {
        id: last_event.id,
        timestamp: last_event.timestamp,
        duration: end - last_event.timestamp,
        data: last_event.data.clone(),
    })
}
