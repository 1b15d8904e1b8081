//! Keyed cache of asynchronous results.
//!
//! Each entry carries a generation number that changes on every write,
//! invalidation or fetch completion. A fetch remembers the generation it
//! started under and its response is dropped if the entry has moved on,
//! so a slow response can never overwrite newer data.
//!
//! Entries with no subscribers are collected `cache_time` after they became
//! unobserved. Subscribing cancels a pending collection.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CallbackResult, Result, SyncError};
use crate::query::{QueryEvent, QueryKey, QueryOptions, QueryState};
use crate::subscription::Subscription;

type Callback = Arc<dyn Fn(&QueryState) -> CallbackResult + Send + Sync>;
type FetchOutcome = std::result::Result<Value, String>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;
type Delivery = (Vec<Callback>, QueryState);

struct InFlight {
    generation: u64,
    result: SharedFetch,
}

struct GcTimer {
    token: u64,
    handle: JoinHandle<()>,
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct CacheEntry {
    key: QueryKey,
    data: Option<Value>,
    error: Option<String>,
    is_stale: bool,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
    generation: u64,
    last_event: Option<QueryEvent>,
    subscribers: Vec<(u64, Callback)>,
    in_flight: Option<InFlight>,
    cache_time: Duration,
    gc: Option<GcTimer>,
}

impl CacheEntry {
    fn new(key: QueryKey, generation: u64, cache_time: Duration) -> Self {
        Self {
            key,
            data: None,
            error: None,
            is_stale: false,
            fetched_at: None,
            updated_at: None,
            generation,
            last_event: None,
            subscribers: Vec::new(),
            in_flight: None,
            cache_time,
            gc: None,
        }
    }

    /// Data young enough to serve without fetching.
    fn fresh_data(&self, stale_time: Duration) -> Option<&Value> {
        if self.is_stale {
            return None;
        }
        let fetched_at = self.fetched_at?;
        if fetched_at.elapsed() < stale_time {
            self.data.as_ref()
        } else {
            None
        }
    }

    fn snapshot(&self) -> QueryState {
        QueryState {
            key: self.key.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            is_stale: self.is_stale,
            is_fetching: self.in_flight.is_some(),
            updated_at: self.updated_at,
            subscriber_count: self.subscribers.len(),
            last_event: self.last_event,
        }
    }

    fn record(&mut self, event: QueryEvent) -> Delivery {
        self.last_event = Some(event);
        let callbacks = self.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
        (callbacks, self.snapshot())
    }

    fn write(&mut self, value: Value) {
        self.data = Some(value);
        self.error = None;
        self.is_stale = false;
        self.fetched_at = Some(Instant::now());
        self.updated_at = Some(Utc::now());
    }
}

struct CacheInner {
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
    /// Held from commit through notification so subscribers observe
    /// changes in commit order. Reentrant: callbacks may write.
    delivery: ReentrantMutex<()>,
    defaults: QueryOptions,
    /// Source of generations, subscriber ids and GC tokens.
    next_id: AtomicU64,
}

/// Shared, cloneable handle to the query cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_options(QueryOptions::default())
    }

    /// Cache whose entries default to `defaults` for `cache_time`.
    pub fn with_options(defaults: QueryOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                delivery: ReentrantMutex::new(()),
                defaults,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_options(QueryOptions::from(config))
    }

    pub fn default_options(&self) -> QueryOptions {
        self.inner.defaults
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return fresh cached data, or fetch it.
    ///
    /// Concurrent calls for the same key share one in-flight fetch. A failed
    /// attempt is retried `opts.retry` times with doubling delays. On final
    /// failure the entry keeps its previous data and records the error.
    pub async fn fetch_query<T, F, Fut, E>(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: F,
        opts: QueryOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = key.into();
        let fetch_fn = Arc::new(fetch_fn);
        loop {
            let (pending, superseded) = {
                let mut entries = self.inner.entries.lock();
                let generation = self.next_id();
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| CacheEntry::new(key.clone(), generation, opts.cache_time));
                entry.cache_time = opts.cache_time;

                if let Some(data) = entry.fresh_data(opts.stale_time) {
                    trace!(key = %key, "serving fresh data");
                    return Ok(serde_json::from_value(data.clone())?);
                }

                match &entry.in_flight {
                    Some(in_flight) => {
                        trace!(key = %key, "joining in-flight fetch");
                        (in_flight.result.clone(), in_flight.generation != entry.generation)
                    }
                    None => {
                        let generation = entry.generation;
                        let fetch_fn = fetch_fn.clone();
                        let result = self.spawn_fetch(key.clone(), generation, move || fetch_fn(), opts);
                        entry.in_flight = Some(InFlight {
                            generation,
                            result: result.clone(),
                        });
                        (result, false)
                    }
                }
            };

            let outcome = pending.await;
            // The fetch we joined started before an invalidation; its
            // response is dropped, so wait for it and fetch again.
            if superseded {
                trace!(key = %key, "joined fetch was superseded, refetching");
                continue;
            }
            return match outcome {
                Ok(data) => Ok(serde_json::from_value(data)?),
                Err(message) => Err(SyncError::Fetch {
                    key: key.to_string(),
                    message,
                }),
            };
        }
    }

    fn spawn_fetch<T, F, Fut, E>(
        &self,
        key: QueryKey,
        generation: u64,
        fetch_fn: F,
        opts: QueryOptions,
    ) -> SharedFetch
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        debug!(key = %key, generation, "fetching");
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = run_with_retry(&key, fetch_fn, &opts).await;
            cache.settle(&key, generation, &outcome);
            outcome
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(format!("fetch task failed: {}", e)))
        }
        .boxed()
        .shared()
    }

    fn settle(&self, key: &QueryKey, generation: u64, outcome: &FetchOutcome) {
        let _delivery = self.inner.delivery.lock();
        let delivery = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                debug!(key = %key, "entry removed before fetch settled");
                return;
            };
            if entry.in_flight.as_ref().map(|f| f.generation) == Some(generation) {
                entry.in_flight = None;
            }
            if entry.generation != generation {
                debug!(key = %key, generation, current = entry.generation, "dropping superseded response");
                if entry.subscribers.is_empty() && entry.gc.is_none() {
                    self.schedule_gc(entry);
                }
                return;
            }

            let event = match outcome {
                Ok(data) => {
                    entry.write(data.clone());
                    QueryEvent::Fetched
                }
                Err(message) => {
                    entry.error = Some(message.clone());
                    QueryEvent::Failed
                }
            };
            entry.generation = self.next_id();
            if entry.subscribers.is_empty() && entry.gc.is_none() {
                self.schedule_gc(entry);
            }
            entry.record(event)
        };
        deliver(vec![delivery]);
    }

    /// Cached data, if present and decodable as `T`.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: impl Into<QueryKey>) -> Option<T> {
        let key = key.into();
        let value = self.get_query_value(&key)?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(key = %key, error = %e, "cached data has unexpected shape");
                None
            }
        }
    }

    pub fn get_query_value(&self, key: impl Into<QueryKey>) -> Option<Value> {
        let key = key.into();
        self.inner
            .entries
            .lock()
            .get(&key)
            .and_then(|e| e.data.clone())
    }

    /// Every entry under `prefix` that holds data.
    pub fn get_queries_data(&self, prefix: impl Into<QueryKey>) -> Vec<(QueryKey, Value)> {
        let prefix = prefix.into();
        self.inner
            .entries
            .lock()
            .values()
            .filter(|e| e.key.starts_with(&prefix))
            .filter_map(|e| e.data.clone().map(|d| (e.key.clone(), d)))
            .collect()
    }

    /// Write data directly. The entry becomes fresh, and any in-flight fetch
    /// for it will have its response dropped.
    pub fn set_query_data<T: Serialize>(&self, key: impl Into<QueryKey>, data: T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.set_query_value(key, value);
        Ok(())
    }

    pub fn set_query_value(&self, key: impl Into<QueryKey>, value: Value) {
        let key = key.into();
        let _delivery = self.inner.delivery.lock();
        let delivery = {
            let mut entries = self.inner.entries.lock();
            let generation = self.next_id();
            let cache_time = self.inner.defaults.cache_time;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), generation, cache_time));
            entry.write(value);
            entry.generation = self.next_id();
            if entry.subscribers.is_empty() && entry.gc.is_none() {
                self.schedule_gc(entry);
            }
            entry.record(QueryEvent::Set)
        };
        trace!(key = %key, "query data set");
        deliver(vec![delivery]);
    }

    /// Replace an entry's data without touching its freshness.
    ///
    /// Staleness, fetch time and generation are kept, so a pending
    /// invalidation still calls for a refetch and an in-flight refetch
    /// still lands. `None` empties the entry, removing it if unobserved.
    pub fn patch_query_value(&self, key: impl Into<QueryKey>, value: Option<Value>) {
        let key = key.into();
        let _delivery = self.inner.delivery.lock();
        let delivery = {
            let mut entries = self.inner.entries.lock();
            match value {
                Some(value) => {
                    let generation = self.next_id();
                    let cache_time = self.inner.defaults.cache_time;
                    let entry = entries
                        .entry(key.clone())
                        .or_insert_with(|| CacheEntry::new(key.clone(), generation, cache_time));
                    if entry.fetched_at.is_none() {
                        entry.fetched_at = Some(Instant::now());
                    }
                    entry.data = Some(value);
                    entry.updated_at = Some(Utc::now());
                    if entry.subscribers.is_empty() && entry.gc.is_none() {
                        self.schedule_gc(entry);
                    }
                    entry.record(QueryEvent::Set)
                }
                None => {
                    let Some(entry) = entries.get_mut(&key) else {
                        return;
                    };
                    if entry.subscribers.is_empty() {
                        entries.remove(&key);
                        trace!(key = %key, "query removed");
                        return;
                    }
                    entry.data = None;
                    entry.updated_at = None;
                    entry.record(QueryEvent::Cleared)
                }
            }
        };
        trace!(key = %key, "query data patched");
        deliver(vec![delivery]);
    }

    /// Read, transform and write back cached data.
    pub fn update_query_data<T, F>(&self, key: impl Into<QueryKey>, updater: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let key = key.into();
        let next = updater(self.get_query_data(&key));
        self.set_query_data(key, next)
    }

    /// Drop an entry's data. An observed entry is kept (empty) so its
    /// subscribers stay registered; an unobserved one is removed.
    pub fn clear_query_data(&self, key: impl Into<QueryKey>) {
        let key = key.into();
        let _delivery = self.inner.delivery.lock();
        let delivery = {
            let mut entries = self.inner.entries.lock();
            let observed = match entries.get(&key) {
                Some(entry) => !entry.subscribers.is_empty(),
                None => return,
            };
            if !observed {
                entries.remove(&key);
                trace!(key = %key, "query removed");
                return;
            }
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            entry.data = None;
            entry.error = None;
            entry.fetched_at = None;
            entry.updated_at = None;
            entry.generation = self.next_id();
            entry.record(QueryEvent::Cleared)
        };
        deliver(vec![delivery]);
    }

    /// Mark every entry under `prefix` stale and notify its subscribers.
    /// Nothing is refetched here; observers decide. Returns the number of
    /// entries marked.
    pub fn invalidate_queries(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let _delivery = self.inner.delivery.lock();
        let deliveries: Vec<Delivery> = {
            let mut entries = self.inner.entries.lock();
            entries
                .values_mut()
                .filter(|e| e.key.starts_with(&prefix))
                .map(|entry| {
                    entry.is_stale = true;
                    entry.generation = self.next_id();
                    entry.record(QueryEvent::Invalidated)
                })
                .collect()
        };
        let count = deliveries.len();
        debug!(prefix = %prefix, count, "invalidated queries");
        deliver(deliveries);
        count
    }

    /// Invalidate one key only, not the keys it prefixes.
    pub fn invalidate_exact(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into();
        let _delivery = self.inner.delivery.lock();
        let delivery = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return false;
            };
            entry.is_stale = true;
            entry.generation = self.next_id();
            entry.record(QueryEvent::Invalidated)
        };
        deliver(vec![delivery]);
        true
    }

    /// Remove every entry under `prefix` without notifying.
    pub fn remove_queries(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        before - entries.len()
    }

    pub fn query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        let key = key.into();
        self.inner.entries.lock().get(&key).map(CacheEntry::snapshot)
    }

    pub fn contains(&self, key: impl Into<QueryKey>) -> bool {
        self.inner.entries.lock().contains_key(&key.into())
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn subscriber_count(&self, key: impl Into<QueryKey>) -> usize {
        self.inner
            .entries
            .lock()
            .get(&key.into())
            .map_or(0, |e| e.subscribers.len())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
        debug!("query cache cleared");
    }

    /// Observe changes to one key. The entry is created if absent, and
    /// is kept alive while at least one subscription exists.
    pub fn subscribe<F>(&self, key: impl Into<QueryKey>, callback: F) -> Subscription
    where
        F: Fn(&QueryState) -> CallbackResult + Send + Sync + 'static,
    {
        let key = key.into();
        let id = self.next_id();
        {
            let mut entries = self.inner.entries.lock();
            let generation = self.next_id();
            let cache_time = self.inner.defaults.cache_time;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), generation, cache_time));
            entry.subscribers.push((id, Arc::new(callback)));
            if entry.gc.take().is_some() {
                trace!(key = %key, "collection cancelled");
            }
        }

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                QueryCache { inner }.unsubscribe(&key, id);
            }
        })
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.subscribers.retain(|(sid, _)| *sid != id);
            if entry.subscribers.is_empty() {
                self.schedule_gc(entry);
            }
        }
    }

    fn schedule_gc(&self, entry: &mut CacheEntry) {
        let token = self.next_id();
        let delay = entry.cache_time;
        let key = entry.key.clone();
        let weak = Arc::downgrade(&self.inner);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        QueryCache { inner }.collect(&key, token);
                    }
                });
                entry.gc = Some(GcTimer { token, handle });
            }
            Err(_) => {
                warn!(key = %entry.key, "no runtime available, entry will not be collected");
            }
        }
    }

    fn collect(&self, key: &QueryKey, token: u64) {
        let mut entries = self.inner.entries.lock();
        let expired = entries.get(key).map_or(false, |e| {
            e.subscribers.is_empty() && e.gc.as_ref().map(|g| g.token) == Some(token)
        });
        if expired {
            entries.remove(key);
            debug!(key = %key, "collected unobserved query");
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}

async fn run_with_retry<T, F, Fut, E>(key: &QueryKey, fetch_fn: F, opts: &QueryOptions) -> FetchOutcome
where
    T: Serialize,
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match fetch_fn().await {
            Ok(data) => return serde_json::to_value(data).map_err(|e| e.to_string()),
            Err(e) if attempt < opts.retry => {
                let delay = opts.backoff(attempt);
                debug!(
                    key = %key,
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, retrying"
                );
                drop(e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(key = %key, attempts = attempt + 1, error = %e, "fetch failed");
                return Err(e.to_string());
            }
        }
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (callbacks, state) in deliveries {
        for callback in callbacks {
            if let Err(e) = callback(&state) {
                warn!(key = %state.key, error = %e, "query subscriber failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn opts() -> QueryOptions {
        QueryOptions::default()
            .stale_time(Duration::from_secs(10))
            .cache_time(Duration::from_secs(1))
            .retry(2)
            .retry_delay(Duration::from_millis(100))
    }

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
        value: Value,
    ) -> impl Fn() -> BoxFuture<'static, std::result::Result<Value, String>> + Clone + Send + Sync + 'static
    {
        move || {
            let calls = calls.clone();
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_is_served_from_cache() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone(), json!([1, 2]));

        let first: Value = cache.fetch_query("cases", fetch.clone(), opts()).await.unwrap();
        let second: Value = cache.fetch_query("cases", fetch, opts()).await.unwrap();

        assert_eq!(first, json!([1, 2]));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_is_refetched() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone(), json!("v"));
        let opts = opts().stale_time(Duration::from_millis(200));

        let _: Value = cache.fetch_query("k", fetch.clone(), opts).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        let _: Value = cache.fetch_query("k", fetch, opts).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_are_deduplicated() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone(), json!({"id": 1}));

        let results = futures::future::join_all((0..5).map(|_| {
            let cache = cache.clone();
            let fetch = fetch.clone();
            async move { cache.fetch_query::<Value, _, _, _>("one", fetch, opts()).await }
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &json!({"id": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_doubling_backoff() {
        let cache = QueryCache::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();
        let log = attempts.clone();

        let result: Value = cache
            .fetch_query(
                "flaky",
                move || {
                    let log = log.clone();
                    async move {
                        let mut log = log.lock();
                        log.push(started.elapsed().as_millis() as u64);
                        if log.len() < 3 {
                            Err("unavailable".to_string())
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                },
                opts(),
            )
            .await
            .unwrap();

        assert_eq!(result, json!("ok"));
        assert_eq!(*attempts.lock(), vec![0, 100, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_failure_keeps_previous_data() {
        let cache = QueryCache::new();
        cache.set_query_data("cases", json!(["old"])).unwrap();
        cache.invalidate_queries("cases");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = cache
            .fetch_query::<Value, _, _, _>(
                "cases",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<Value, _>("boom") }
                },
                opts(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Fetch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = cache.query_state("cases").unwrap();
        assert_eq!(state.data, Some(json!(["old"])));
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(state.last_event, Some(QueryEvent::Failed));
        assert!(!state.is_fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_response_is_dropped() {
        let cache = QueryCache::new();
        let slow = cache.clone();
        let task = tokio::spawn(async move {
            slow.fetch_query::<Value, _, _, _>(
                "case",
                || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(json!("server"))
                },
                opts(),
            )
            .await
        });

        sleep(Duration::from_millis(10)).await;
        cache.set_query_data("case", json!("local")).unwrap();

        assert_eq!(task.await.unwrap().unwrap(), json!("server"));
        assert_eq!(cache.get_query_data::<Value>("case"), Some(json!("local")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_mid_fetch_keeps_deduplication() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone(), json!("v"));

        let first = tokio::spawn({
            let cache = cache.clone();
            let fetch = fetch.clone();
            async move { cache.fetch_query::<Value, _, _, _>("k", fetch, opts()).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(cache.query_state("k").unwrap().is_fetching);
        assert_eq!(cache.invalidate_queries("k"), 1);
        assert!(cache.query_state("k").unwrap().is_fetching);

        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch_query::<Value, _, _, _>("k", fetch, opts()).await }
        });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(first.await.unwrap().unwrap(), json!("v"));
        assert_eq!(second.await.unwrap().unwrap(), json!("v"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = cache.query_state("k").unwrap();
        assert!(!state.is_stale);
        assert!(!state.is_fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_fetch_still_collects_entry() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting_fetch(calls.clone(), json!("v"));

        let caller = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch_query::<Value, _, _, _>("leak", fetch, opts()).await }
        });
        sleep(Duration::from_millis(10)).await;
        cache.invalidate_exact("leak");
        caller.abort();

        sleep(Duration::from_millis(100)).await;
        assert!(cache.contains("leak"));
        assert!(!cache.query_state("leak").unwrap().is_fetching);

        sleep(Duration::from_secs(60)).await;
        assert!(!cache.contains("leak"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_keeps_staleness() {
        let cache = QueryCache::new();
        cache.set_query_data("k", "old").unwrap();
        cache.invalidate_exact("k");

        cache.patch_query_value("k", Some(json!("restored")));
        let state = cache.query_state("k").unwrap();
        assert_eq!(state.data, Some(json!("restored")));
        assert!(state.is_stale);
        assert_eq!(state.last_event, Some(QueryEvent::Set));

        cache.patch_query_value("k", None);
        assert!(!cache.contains("k"));

        let _sub = cache.subscribe("watched", |_| Ok(()));
        cache.patch_query_value("watched", Some(json!(1)));
        cache.patch_query_value("watched", None);
        let state = cache.query_state("watched").unwrap();
        assert_eq!(state.data, None);
        assert_eq!(state.last_event, Some(QueryEvent::Cleared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_cancels_collection() {
        let cache = QueryCache::with_options(opts());
        cache.subscribe("k", |_| Ok(())).unsubscribe();

        sleep(Duration::from_millis(500)).await;
        let sub = cache.subscribe("k", |_| Ok(()));
        sleep(Duration::from_millis(600)).await;
        assert!(cache.contains("k"));

        drop(sub);
        sleep(Duration::from_millis(1001)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_data_is_collected() {
        let cache = QueryCache::with_options(opts());
        cache.set_query_data("k", 1).unwrap();
        sleep(Duration::from_millis(999)).await;
        assert!(cache.contains("k"));
        sleep(Duration::from_millis(2)).await;
        assert!(!cache.contains("k"));
    }

    #[tokio::test]
    async fn test_invalidate_notifies_prefix_matches() {
        let cache = QueryCache::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for key in [QueryKey::list("cases"), QueryKey::detail("cases", 1), QueryKey::list("threats")] {
            let events = events.clone();
            subs.push(cache.subscribe(&key, move |state| {
                events.lock().push((state.key.clone(), state.last_event));
                Ok(())
            }));
        }

        let count = cache.invalidate_queries(QueryKey::entity("cases"));

        assert_eq!(count, 2);
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(k, e)| k.entity_name() == Some("cases")
            && *e == Some(QueryEvent::Invalidated)));
        assert!(cache.query_state(QueryKey::list("cases")).unwrap().is_stale);
        assert!(!cache.query_state(QueryKey::list("threats")).unwrap().is_stale);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let cache = QueryCache::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _a = cache.subscribe("k", |_| Err("subscriber broke".into()));
        let _b = cache.subscribe("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        cache.set_query_data("k", "v").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_clear_and_remove() {
        let cache = QueryCache::new();
        cache
            .update_query_data::<Vec<i32>, _>("nums", |old| {
                let mut v = old.unwrap_or_default();
                v.push(1);
                v
            })
            .unwrap();
        cache
            .update_query_data::<Vec<i32>, _>("nums", |old| {
                let mut v = old.unwrap_or_default();
                v.push(2);
                v
            })
            .unwrap();
        assert_eq!(cache.get_query_data::<Vec<i32>>("nums"), Some(vec![1, 2]));

        let sub = cache.subscribe("nums", |_| Ok(()));
        cache.clear_query_data("nums");
        assert!(cache.contains("nums"));
        assert_eq!(cache.get_query_value("nums"), None);
        drop(sub);

        cache.set_query_data(QueryKey::detail("cases", 1), 1).unwrap();
        cache.set_query_data(QueryKey::detail("cases", 2), 2).unwrap();
        assert_eq!(cache.remove_queries(QueryKey::entity("cases")), 2);
        assert_eq!(cache.get_queries_data(QueryKey::entity("cases")).len(), 0);
    }
}
