//! Metadata enrichment applied before encoding

use crate::types::Event;

/// Fill the event type name into an event's envelope
///
/// Only sets `event_type` when the caller left it empty; every other field is
/// left as-is. Undefined events carry no envelope and pass through unchanged.
pub fn enrich<T>(mut event: Event<T>, event_type: &str) -> Event<T> {
    if let Some(metadata) = event.metadata_mut() {
        if metadata.event_type.is_none() {
            metadata.event_type = Some(event_type.to_string());
        }
    }
    event
}

/// Enrich a whole batch for publishing under `event_type`
pub fn enrich_all<T>(events: Vec<Event<T>>, event_type: &str) -> Vec<Event<T>> {
    events.into_iter().map(|e| enrich(e, event_type)).collect()
}
