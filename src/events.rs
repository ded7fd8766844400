//! Content-change events and the `events` queue

use crate::broker::{Broker, EnqueueOptions, JobHandle};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

/// Queue carrying content-change events
pub const EVENTS_QUEUE: &str = "events";

/// Task type of a content-change event job
pub const TASK_TYPE_COLLECTION_EVENT: &str = "events:collection";

/// Kind of content mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(alias = "collection:created")]
    CollectionCreated,
    #[serde(alias = "collection:updated")]
    CollectionUpdated,
    #[serde(alias = "collection:deleted")]
    CollectionDeleted,
    #[serde(alias = "item:created")]
    ItemCreated,
    #[serde(alias = "item:updated")]
    ItemUpdated,
    #[serde(alias = "item:deleted")]
    ItemDeleted,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CollectionCreated => "collection_created",
            EventType::CollectionUpdated => "collection_updated",
            EventType::CollectionDeleted => "collection_deleted",
            EventType::ItemCreated => "item_created",
            EventType::ItemUpdated => "item_updated",
            EventType::ItemDeleted => "item_deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One content mutation, produced once and never updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    pub event_type: EventType,
    pub collection_name: String,
    pub item_id: u64,
    #[serde(default)]
    pub item_data: serde_json::Map<String, serde_json::Value>,
}

impl CollectionEvent {
    /// Decode an event from its wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the bytes are not a valid event.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::Decode(format!("invalid event: {e}")))
    }

    /// Encode the event to its wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Decode(format!("unencodable event: {e}")))
    }
}

/// Publish a content-change event onto the `events` queue
///
/// Called by the content layer whenever an item or collection mutates.
///
/// # Errors
///
/// Returns `Error::Enqueue` if the broker rejects the job.
pub async fn enqueue_collection_event(
    broker: &dyn Broker,
    event: &CollectionEvent,
    options: &EnqueueOptions,
) -> Result<JobHandle> {
    let payload = event.encode()?;

    let id = broker
        .enqueue(EVENTS_QUEUE, TASK_TYPE_COLLECTION_EVENT, &payload, options)
        .await
        .map_err(|e| {
            error!(
                event_type = %event.event_type,
                collection = %event.collection_name,
                "Failed to enqueue collection event: {}",
                e
            );
            Error::Enqueue(e.to_string())
        })?;

    info!(
        job_id = %id,
        event_type = %event.event_type,
        collection = %event.collection_name,
        "Enqueued collection event"
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_event() {
        let raw = br#"{"event_type":"item_created","collection_name":"articles","item_id":42,"item_data":{"title":"Hello"}}"#;
        let event = CollectionEvent::decode(raw).unwrap();

        assert_eq!(event.event_type, EventType::ItemCreated);
        assert_eq!(event.collection_name, "articles");
        assert_eq!(event.item_id, 42);
        assert_eq!(event.item_data.get("title"), Some(&json!("Hello")));
    }

    #[test]
    fn test_decode_accepts_colon_event_types() {
        let raw = br#"{"event_type":"collection:deleted","collection_name":"pages","item_id":0}"#;
        let event = CollectionEvent::decode(raw).unwrap();

        assert_eq!(event.event_type, EventType::CollectionDeleted);
        assert!(event.item_data.is_empty());
    }

    #[test]
    fn test_encode_uses_snake_case() {
        let event = CollectionEvent {
            event_type: EventType::ItemUpdated,
            collection_name: "articles".to_string(),
            item_id: 7,
            item_data: serde_json::Map::new(),
        };
        let value: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["event_type"], "item_updated");
    }

    #[test]
    fn test_malformed_events_are_decode_errors() {
        for raw in [
            &b"not json"[..],
            br#"{"event_type":"item_exploded","collection_name":"a","item_id":1}"#,
            br#"{"event_type":"item_created","collection_name":"a","item_id":-1}"#,
            br#"{"event_type":"item_created","item_id":1}"#,
        ] {
            let err = CollectionEvent::decode(raw).unwrap_err();
            assert!(matches!(err, Error::Decode(_)));
            assert!(!err.is_retryable());
        }
    }
}
