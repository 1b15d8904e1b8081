//! Server-pushed change events.
//!
//! Inbound frames are JSON objects of the form
//! `{"type": "update", "entity": "cases", "data": {...}, "timestamp": ..., "source": ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::debug;

/// Kind of change a server event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncEventType {
    Create,
    Update,
    Delete,
    /// The whole entity namespace changed; everything under it is stale.
    Sync,
}

/// A change pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub entity: String,
    #[serde(default)]
    pub data: Value,
    #[serde(with = "crate::time::flexible", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Originating client, when the server reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SyncEvent {
    pub fn new(event_type: SyncEventType, entity: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            entity: entity.into(),
            data,
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn created(entity: impl Into<String>, data: Value) -> Self {
        Self::new(SyncEventType::Create, entity, data)
    }

    pub fn updated(entity: impl Into<String>, data: Value) -> Self {
        Self::new(SyncEventType::Update, entity, data)
    }

    pub fn deleted(entity: impl Into<String>, data: Value) -> Self {
        Self::new(SyncEventType::Delete, entity, data)
    }

    pub fn sync(entity: impl Into<String>) -> Self {
        Self::new(SyncEventType::Sync, entity, Value::Null)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// `data.id`, if present.
    pub fn item_id(&self) -> Option<&Value> {
        self.data.get("id").filter(|id| !id.is_null())
    }
}

/// Stream of processed events, optionally restricted to one entity.
pub struct EventStream {
    inner: BroadcastStream<SyncEvent>,
    entity: Option<String>,
}

impl EventStream {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, entity: Option<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            entity,
        }
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    fn matches(&self, event: &SyncEvent) -> bool {
        self.entity.as_deref().map_or(true, |e| e == event.entity)
    }
}

impl Stream for EventStream {
    type Item = SyncEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(event)) if this.matches(&event) => return Poll::Ready(Some(event)),
                Some(Ok(_)) => continue,
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    debug!(skipped, "event stream lagged");
                    continue;
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[test]
    fn test_parse_inbound_frame() {
        let event: SyncEvent = serde_json::from_str(
            r#"{"type":"update","entity":"cases","data":{"id":7,"title":"x"},"timestamp":1709287200000}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, SyncEventType::Update);
        assert_eq!(event.entity, "cases");
        assert_eq!(event.item_id(), Some(&json!(7)));
        assert_eq!(event.timestamp.timestamp(), 1_709_287_200);
        assert!(event.source.is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let event: SyncEvent = serde_json::from_str(r#"{"type":"sync","entity":"actors"}"#).unwrap();
        assert_eq!(event.event_type, SyncEventType::Sync);
        assert!(event.data.is_null());
        assert!(event.item_id().is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<SyncEvent>(r#"{"type":"upsert","entity":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_stream_filters_by_entity() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = EventStream::new(rx, Some("cases".to_string()));

        tx.send(SyncEvent::sync("threats")).unwrap();
        tx.send(SyncEvent::updated("cases", json!({"id": 1}))).unwrap();
        drop(tx);

        let event = stream.next().await.unwrap();
        assert_eq!(event.entity, "cases");
        assert!(stream.next().await.is_none());
    }
}
