//! In-memory storage. Not durable; for tests and for running without a
//! database file.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::persist::storage::{validate_key, KeyValueStorage, StoredValue};

/// `BTreeMap` behind a `RwLock`, so key listing comes out ordered.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<String, StoredValue>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        validate_key(key)?;
        self.data.write().insert(
            key.to_string(),
            StoredValue {
                key: key.to_string(),
                value,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.data.write().remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[tokio::test]
    async fn test_set_get_remove() {
        let storage = MemoryStorage::new();
        storage.set("/cb/ui", "{}".to_string()).await.unwrap();

        let stored = storage.get("/cb/ui").await.unwrap().unwrap();
        assert_eq!(stored.value, "{}");
        assert!(storage.contains("/cb/ui").await.unwrap());

        assert!(storage.remove("/cb/ui").await.unwrap());
        assert!(!storage.remove("/cb/ui").await.unwrap());
        assert!(storage.get("/cb/ui").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["/cb/ui", "/cb/session", "/other/x", "/cb2/y"] {
            storage.set(key, "1".to_string()).await.unwrap();
        }
        assert_eq!(storage.keys("/cb/").await.unwrap(), vec!["/cb/session", "/cb/ui"]);
        assert_eq!(storage.keys("/").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Prefs {
            dark: bool,
        }

        let storage = MemoryStorage::new();
        storage.set_json("/prefs", &Prefs { dark: true }).await.unwrap();
        let prefs: Prefs = storage.get_json("/prefs").await.unwrap().unwrap();
        assert_eq!(prefs, Prefs { dark: true });
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let storage = MemoryStorage::new();
        assert!(storage.set("no-slash", String::new()).await.is_err());
    }
}
