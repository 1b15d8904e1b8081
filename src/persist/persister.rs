//! Write-through of selected state slices to local storage.
//!
//! On startup [`Persister::load`] reads every configured slice once and
//! dispatches a single hydration action. [`Persister::attach`] then writes
//! slices back after changes settle for the configured debounce, skipping
//! slices whose serialized form has not changed since the last write.
//! Storage failures are logged and never reach the store.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PersistConfig;
use crate::error::Result;
use crate::persist::memory::MemoryStorage;
use crate::persist::sqlite::SqliteStorage;
use crate::persist::storage::KeyValueStorage;
use crate::store::{Reducer, Store};
use crate::subscription::Subscription;

/// A root state that can be saved slice by slice.
pub trait Persistable: Reducer {
    /// Slice names with their serialized values.
    fn persisted_slices(&self) -> Vec<(&'static str, Value)>;

    /// Action that restores slices from loaded values.
    fn hydrate(slices: BTreeMap<String, Value>) -> Self::Action;
}

struct PersisterInner {
    storage: Arc<dyn KeyValueStorage>,
    config: PersistConfig,
    /// Last text written or loaded per slice.
    written: Mutex<HashMap<String, String>>,
}

/// Saves and restores slices through a [`KeyValueStorage`].
#[derive(Clone)]
pub struct Persister {
    inner: Arc<PersisterInner>,
}

impl Persister {
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: PersistConfig) -> Self {
        Self {
            inner: Arc::new(PersisterInner {
                storage,
                config,
                written: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// SQLite at `config.path`, or in-memory storage when no path is set.
    pub async fn open(config: &PersistConfig) -> Result<Self> {
        let storage: Arc<dyn KeyValueStorage> = match &config.path {
            Some(path) => Arc::new(SqliteStorage::open(path).await?),
            None => {
                debug!("no persist path configured, using memory storage");
                Arc::new(MemoryStorage::new())
            }
        };
        Ok(Self::new(storage, config.clone()))
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.inner.storage
    }

    pub fn config(&self) -> &PersistConfig {
        &self.inner.config
    }

    fn persists(&self, slice: &str) -> bool {
        self.inner.config.enabled && self.inner.config.slices.iter().any(|s| s == slice)
    }

    /// Read persisted slices and hydrate the store. Returns how many slices
    /// were restored. Unreadable slices are skipped.
    pub async fn load<S: Persistable>(&self, store: &Store<S>) -> Result<usize> {
        if !self.inner.config.enabled {
            return Ok(0);
        }

        let mut loaded = BTreeMap::new();
        for slice in &self.inner.config.slices {
            let key = self.inner.config.slice_key(slice);
            let stored = match self.inner.storage.get(&key).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "could not read persisted slice");
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&stored.value) {
                Ok(value) => {
                    self.inner.written.lock().insert(slice.clone(), stored.value);
                    loaded.insert(slice.clone(), value);
                }
                Err(e) => warn!(key = %key, error = %e, "persisted slice is not valid JSON"),
            }
        }

        let count = loaded.len();
        if count > 0 {
            store.dispatch(S::hydrate(loaded))?;
            info!(count, "hydrated persisted slices");
        }
        Ok(count)
    }

    /// Write every configured slice that changed since the last write.
    /// Returns the number of slices written.
    pub async fn flush<S: Persistable>(&self, state: &S) -> usize {
        let mut written = 0;
        for (slice, value) in state.persisted_slices() {
            if !self.persists(slice) {
                continue;
            }
            let text = match serde_json::to_string(&value) {
                Ok(text) => text,
                Err(e) => {
                    warn!(slice, error = %e, "could not serialize slice");
                    continue;
                }
            };
            if self.inner.written.lock().get(slice) == Some(&text) {
                continue;
            }

            let key = self.inner.config.slice_key(slice);
            match self.inner.storage.set(&key, text.clone()).await {
                Ok(()) => {
                    self.inner.written.lock().insert(slice.to_string(), text);
                    written += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "could not persist slice"),
            }
        }
        if written > 0 {
            debug!(written, "persisted slices");
        }
        written
    }

    /// Write changed slices after each burst of state changes. Must be
    /// called within a Tokio runtime.
    pub fn attach<S: Persistable>(&self, store: &Store<S>) -> PersistHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let subscription = store.subscribe(move |_| {
            let _ = tx.send(());
            Ok(())
        });

        let persister = self.clone();
        let store = store.clone();
        let debounce = self.inner.config.debounce();
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
                let state = store.get_state();
                persister.flush(&*state).await;
            }
        });

        PersistHandle {
            subscription: Some(subscription),
            task: Some(task),
        }
    }
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Running write-through. Dropping it stops writing immediately;
/// [`PersistHandle::shutdown`] writes pending changes first.
pub struct PersistHandle {
    subscription: Option<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl PersistHandle {
    /// Stop listening, flush what is pending and wait for the writer.
    pub async fn shutdown(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PersistHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
