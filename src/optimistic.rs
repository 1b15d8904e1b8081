//! Optimistic updates over the query cache.
//!
//! `apply` writes a speculative value into the entity's detail entry and
//! into every cached list that contains it, remembering what was there
//! before. The pending mutation is then either confirmed (the snapshot is
//! dropped) or rolled back (the snapshot is restored).
//!
//! Only one record exists per `(entity, id)`. Applying again before it
//! settles replaces the speculative value but keeps the first snapshot,
//! so a rollback always returns to the last server-confirmed state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

use crate::conflict::{self, Strategy};
use crate::error::{Result, SyncError};
use crate::query::{QueryCache, QueryKey};

/// A mutation awaiting confirmation.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub entity: String,
    pub id: Value,
    pub speculative: Value,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    /// Prior detail value; `None` if the entity was not cached.
    detail: Option<Value>,
    /// Prior list element per list key; `None` if it was appended.
    lists: Vec<(QueryKey, Option<Value>)>,
}

#[derive(Debug)]
struct Record {
    mutation: PendingMutation,
    snapshot: Snapshot,
}

/// Applies, confirms and rolls back speculative writes.
pub struct OptimisticManager {
    cache: QueryCache,
    pending: Mutex<HashMap<QueryKey, Record>>,
}

impl OptimisticManager {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Write `speculative` for `(entity, id)` and record how to undo it.
    pub fn apply<T: Serialize>(&self, entity: &str, id: impl Into<Value>, speculative: T) -> Result<()> {
        let id = id.into();
        let speculative = serde_json::to_value(speculative)?;
        let detail_key = QueryKey::detail(entity, id.clone());
        let plain_list = QueryKey::list(entity);

        let mut lists = Vec::new();
        let mut writes = Vec::new();
        for (key, data) in self.cache.get_queries_data(&plain_list) {
            let Value::Array(mut items) = data else {
                continue;
            };
            if let Some(pos) = items.iter().position(|item| has_id(item, &id)) {
                let prior = std::mem::replace(&mut items[pos], speculative.clone());
                lists.push((key.clone(), Some(prior)));
                writes.push((key, Value::Array(items)));
            }
        }

        let detail = self.cache.get_query_value(&detail_key);
        if detail.is_none() && lists.is_empty() {
            if let Some(Value::Array(mut items)) = self.cache.get_query_value(&plain_list) {
                items.push(speculative.clone());
                lists.push((plain_list.clone(), None));
                writes.push((plain_list, Value::Array(items)));
            }
        }

        {
            let mut pending = self.pending.lock();
            match pending.get_mut(&detail_key) {
                Some(record) => {
                    for (key, prior) in lists {
                        if !record.snapshot.lists.iter().any(|(k, _)| *k == key) {
                            record.snapshot.lists.push((key, prior));
                        }
                    }
                    record.mutation.speculative = speculative.clone();
                    debug!(key = %detail_key, "re-applied pending mutation, keeping first snapshot");
                }
                None => {
                    pending.insert(
                        detail_key.clone(),
                        Record {
                            mutation: PendingMutation {
                                entity: entity.to_string(),
                                id: id.clone(),
                                speculative: speculative.clone(),
                                applied_at: Utc::now(),
                            },
                            snapshot: Snapshot { detail, lists },
                        },
                    );
                }
            }
        }

        self.cache.set_query_value(&detail_key, speculative);
        for (key, value) in writes {
            self.cache.set_query_value(key, value);
        }
        Ok(())
    }

    /// Accept the speculative value. The cache is left as it is.
    pub fn confirm(&self, entity: &str, id: impl Into<Value>) -> bool {
        let key = QueryKey::detail(entity, id.into());
        let confirmed = self.pending.lock().remove(&key).is_some();
        if confirmed {
            debug!(key = %key, "mutation confirmed");
        }
        confirmed
    }

    /// Restore the state captured by the first unsettled `apply`.
    ///
    /// Only data is restored. An invalidation that arrived meanwhile keeps
    /// the entries stale.
    pub fn rollback(&self, entity: &str, id: impl Into<Value>) -> bool {
        let id = id.into();
        let detail_key = QueryKey::detail(entity, id.clone());
        let Some(record) = self.pending.lock().remove(&detail_key) else {
            return false;
        };

        self.cache.patch_query_value(&detail_key, record.snapshot.detail);

        for (key, prior) in record.snapshot.lists {
            let Some(Value::Array(mut items)) = self.cache.get_query_value(&key) else {
                continue;
            };
            match prior {
                Some(prior) => {
                    if let Some(pos) = items.iter().position(|item| has_id(item, &id)) {
                        items[pos] = prior;
                    }
                }
                None => items.retain(|item| !has_id(item, &id)),
            }
            self.cache.patch_query_value(key, Some(Value::Array(items)));
        }

        info!(key = %detail_key, "mutation rolled back");
        true
    }

    /// Apply `speculative`, await `request`, then settle.
    ///
    /// If the detail entry was invalidated while the request was in flight
    /// (a server push raced the mutation), the speculative value is
    /// resolved against the response with `strategy` and the result is
    /// written back. Otherwise the mutation is confirmed. A failed request
    /// rolls back.
    pub async fn mutate<T, R, E, Fut>(
        &self,
        entity: &str,
        id: impl Into<Value>,
        speculative: T,
        request: Fut,
        strategy: Strategy,
    ) -> Result<Value>
    where
        T: Serialize,
        R: Serialize,
        E: fmt::Display,
        Fut: Future<Output = std::result::Result<R, E>>,
    {
        let id = id.into();
        let detail_key = QueryKey::detail(entity, id.clone());
        self.apply(entity, id.clone(), speculative)?;

        let server = match request.await {
            Ok(response) => serde_json::to_value(response),
            Err(e) => {
                self.rollback(entity, id);
                return Err(SyncError::Fetch {
                    key: detail_key.to_string(),
                    message: e.to_string(),
                });
            }
        };
        let server = match server {
            Ok(server) => server,
            Err(e) => {
                self.rollback(entity, id);
                return Err(e.into());
            }
        };

        let raced = self
            .cache
            .query_state(&detail_key)
            .map_or(false, |state| state.is_stale);
        if !raced {
            self.confirm(entity, id);
            return Ok(server);
        }

        let client = self
            .pending
            .lock()
            .remove(&detail_key)
            .map(|r| r.mutation.speculative);
        let resolved = match client {
            Some(client) => conflict::resolve(&client, &server, strategy),
            None => server,
        };
        info!(key = %detail_key, strategy = %strategy, "mutation raced a server push");
        self.write_through(entity, &id, resolved.clone());
        Ok(resolved)
    }

    fn write_through(&self, entity: &str, id: &Value, value: Value) {
        for (key, data) in self.cache.get_queries_data(QueryKey::list(entity)) {
            let Value::Array(mut items) = data else {
                continue;
            };
            if let Some(pos) = items.iter().position(|item| has_id(item, id)) {
                items[pos] = value.clone();
                self.cache.patch_query_value(key, Some(Value::Array(items)));
            }
        }
        self.cache
            .patch_query_value(QueryKey::detail(entity, id.clone()), Some(value));
    }

    pub fn is_pending(&self, entity: &str, id: impl Into<Value>) -> bool {
        self.pending
            .lock()
            .contains_key(&QueryKey::detail(entity, id.into()))
    }

    /// Unsettled mutations, oldest first.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<PendingMutation> = self
            .pending
            .lock()
            .values()
            .map(|r| r.mutation.clone())
            .collect();
        pending.sort_by_key(|m| m.applied_at);
        pending
    }
}

impl fmt::Debug for OptimisticManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticManager")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Ids compare as JSON, falling back to their string form so `7` and
/// `"7"` name the same entity.
fn has_id(item: &Value, id: &Value) -> bool {
    let Some(item_id) = item.get("id") else {
        return false;
    };
    item_id == id || id_string(item_id).is_some() && id_string(item_id) == id_string(id)
}

fn id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
