//! Key-value storage abstraction for persisted slices.
//!
//! Keys are path-like (`/caseboard/ui`) and values are JSON text. Backends
//! implement the four primitive operations; JSON helpers are provided.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// A stored value with its write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredValue {
    /// Deserialize the value as JSON.
    pub fn value_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.value).map_err(Into::into)
    }
}

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SyncError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(SyncError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if !key.starts_with('/') {
        return Err(SyncError::InvalidKey("key must start with '/'".to_string()));
    }
    Ok(())
}

/// Durable string storage used by the persister.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Get a value by key. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Create or overwrite a key.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get a value and deserialize it as JSON.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        match self.get(key).await? {
            Some(stored) => Ok(Some(stored.value_json()?)),
            None => Ok(None),
        }
    }

    /// Set a key to a JSON-encoded value.
    async fn set_json<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        let text = serde_json::to_string(value)?;
        self.set(key, text).await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
