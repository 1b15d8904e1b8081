//! Snapshots of cache entries delivered to subscribers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::query::QueryKey;

/// What last changed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryEvent {
    /// A fetch succeeded.
    Fetched,
    /// A fetch failed after all retries.
    Failed,
    /// Data was written directly.
    Set,
    /// The entry was marked stale.
    Invalidated,
    /// The entry's data was cleared.
    Cleared,
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct QueryState {
    pub key: QueryKey,
    pub data: Option<Value>,
    /// Message of the last failed fetch, kept until the next success.
    pub error: Option<String>,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    /// The most recent change to this entry, if any.
    pub last_event: Option<QueryEvent>,
}

impl QueryState {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.data.is_some()
    }

    /// Deserialize the data, if present and well-formed.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }
}
