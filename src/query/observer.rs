//! Live view of one query that refetches when invalidated.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::query::{QueryCache, QueryEvent, QueryKey, QueryOptions, QueryState};
use crate::subscription::Subscription;

/// Keeps a query subscribed, fetched and current.
///
/// Created with [`QueryCache::observe`]. Dropping the observer unsubscribes
/// and stops refetching, which starts the entry's collection timer.
pub struct QueryObserver {
    key: QueryKey,
    state: watch::Receiver<Option<QueryState>>,
    task: JoinHandle<()>,
    _subscription: Subscription,
}

impl QueryCache {
    /// Subscribe to `key`, fetch it now, and fetch again every time it is
    /// invalidated. Must be called within a Tokio runtime.
    pub fn observe<T, F, Fut, E>(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: F,
        opts: QueryOptions,
    ) -> QueryObserver
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = key.into();
        let (state_tx, state_rx) = watch::channel(self.query_state(&key));
        let (refetch_tx, mut refetch_rx) = mpsc::unbounded_channel::<()>();

        let subscription = self.subscribe(&key, move |state| {
            if state.last_event == Some(QueryEvent::Invalidated) {
                let _ = refetch_tx.send(());
            }
            state_tx.send_replace(Some(state.clone()));
            Ok(())
        });

        let cache = self.clone();
        let fetch_fn = Arc::new(fetch_fn);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            loop {
                let f = fetch_fn.clone();
                let fetched = cache
                    .fetch_query::<T, _, _, _>(&task_key, move || (*f)(), opts)
                    .await;
                if let Err(e) = fetched {
                    debug!(key = %task_key, error = %e, "observer fetch failed");
                }
                if refetch_rx.recv().await.is_none() {
                    break;
                }
                // Collapse invalidations that arrived during the fetch.
                while refetch_rx.try_recv().is_ok() {}
            }
        });

        QueryObserver {
            key,
            state: state_rx,
            task,
            _subscription: subscription,
        }
    }
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest known state of the entry.
    pub fn state(&self) -> Option<QueryState> {
        self.state.borrow().clone()
    }

    pub fn data<T: DeserializeOwned>(&self) -> Option<T> {
        self.state.borrow().as_ref().and_then(QueryState::data_as)
    }

    /// Wait for the next change. Returns false once the cache side is gone.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    /// Stream of states, starting with the current one.
    pub fn stream(&self) -> WatchStream<Option<QueryState>> {
        WatchStream::new(self.state.clone())
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_observer_refetches_on_invalidation() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let observer = cache.observe(
            QueryKey::list("cases"),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(json!([n])) }
            },
            QueryOptions::default(),
        );

        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.data::<Value>(), Some(json!([0])));

        cache.invalidate_queries(QueryKey::entity("cases"));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(observer.data::<Value>(), Some(json!([1])));
        assert_eq!(cache.subscriber_count(QueryKey::list("cases")), 1);

        drop(observer);
        assert_eq!(cache.subscriber_count(QueryKey::list("cases")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_reports_updates() {
        let cache = QueryCache::new();
        let mut observer = cache.observe(
            "settings",
            || async { Ok::<_, String>(json!({"dark": true})) },
            QueryOptions::default(),
        );

        assert!(observer.changed().await);
        let state = observer.state().unwrap();
        assert_eq!(state.last_event, Some(QueryEvent::Fetched));
        assert!(state.is_success());
    }
}
