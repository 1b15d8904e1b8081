//! Dispatch middleware.
//!
//! A middleware receives the store, the action and a [`Next`] handle for the
//! rest of the chain. `Next` is consumed by [`Next::run`], so an action is
//! forwarded at most once; dropping it without running short-circuits the
//! action.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::store::{Action, Reducer, Store};

/// An interceptor in the dispatch pipeline.
pub trait Middleware<S: Reducer>: Send + Sync {
    /// Handle one action. Call `next.run(action)` to pass it on.
    fn handle(&self, store: &Store<S>, action: S::Action, next: Next<'_, S>) -> Result<()>;
}

/// The remainder of the middleware chain for one dispatch.
pub struct Next<'a, S: Reducer> {
    store: &'a Store<S>,
    chain: &'a [Arc<dyn Middleware<S>>],
}

impl<'a, S: Reducer> Next<'a, S> {
    pub(crate) fn new(store: &'a Store<S>, chain: &'a [Arc<dyn Middleware<S>>]) -> Self {
        Self { store, chain }
    }

    /// Forward the action to the next middleware, or to the reducer at the end.
    pub fn run(self, action: S::Action) -> Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(
                self.store,
                action,
                Next {
                    store: self.store,
                    chain: rest,
                },
            ),
            None => self.store.reduce(action),
        }
    }
}

/// Middleware built from a closure.
pub struct FnMiddleware<F>(F);

/// Wrap a closure as middleware.
pub fn from_fn<S, F>(f: F) -> FnMiddleware<F>
where
    S: Reducer,
    F: Fn(&Store<S>, S::Action, Next<'_, S>) -> Result<()> + Send + Sync,
{
    FnMiddleware(f)
}

impl<S, F> Middleware<S> for FnMiddleware<F>
where
    S: Reducer,
    F: Fn(&Store<S>, S::Action, Next<'_, S>) -> Result<()> + Send + Sync,
{
    fn handle(&self, store: &Store<S>, action: S::Action, next: Next<'_, S>) -> Result<()> {
        (self.0)(store, action, next)
    }
}

/// Logs every action with timing and whether it changed the root.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerMiddleware;

impl<S: Reducer> Middleware<S> for LoggerMiddleware {
    fn handle(&self, store: &Store<S>, action: S::Action, next: Next<'_, S>) -> Result<()> {
        let action_type = action.action_type();
        let before = store.get_state();
        let started = Instant::now();

        let result = next.run(action);

        let changed = !Arc::ptr_eq(&before, &store.get_state());
        match &result {
            Ok(()) => debug!(
                action = %action_type,
                changed,
                elapsed_us = started.elapsed().as_micros() as u64,
                "action dispatched"
            ),
            Err(e) => warn!(action = %action_type, error = %e, "action failed"),
        }
        result
    }
}

/// Drops actions matching a predicate.
pub struct FilterMiddleware<S: Reducer> {
    reject: Box<dyn Fn(&S::Action) -> bool + Send + Sync>,
}

impl<S: Reducer> FilterMiddleware<S> {
    /// Reject every action for which `reject` returns true.
    pub fn new(reject: impl Fn(&S::Action) -> bool + Send + Sync + 'static) -> Self {
        Self {
            reject: Box::new(reject),
        }
    }
}

impl<S: Reducer> Middleware<S> for FilterMiddleware<S> {
    fn handle(&self, _store: &Store<S>, action: S::Action, next: Next<'_, S>) -> Result<()> {
        if (self.reject)(&action) {
            debug!(action = %action.action_type(), "action filtered");
            return Ok(());
        }
        next.run(action)
    }
}

/// One recorded action.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub action_type: String,
    /// Serialized action; masked fields stay masked.
    pub payload: Value,
    pub at: DateTime<Utc>,
    /// Set when the rest of the chain rejected the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

/// Read side of [`HistoryMiddleware`], for debugging and introspection.
#[derive(Debug, Clone)]
pub struct HistoryHandle {
    records: Arc<Mutex<VecDeque<HistoryRecord>>>,
    next_seq: Arc<AtomicU64>,
    capacity: usize,
}

impl HistoryHandle {
    /// Recorded actions, oldest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Types of the actions that went through without error, oldest first.
    pub fn action_types(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.error.is_none())
            .map(|r| r.action_type.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn push(&self, mut record: HistoryRecord) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        record.seq = seq;
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        seq
    }

    fn mark_failed(&self, seq: u64, error: &SyncError) {
        if let Some(record) = self.records.lock().iter_mut().find(|r| r.seq == seq) {
            record.error = Some(error.to_string());
        }
    }
}

/// Keeps a bounded ring buffer of dispatched actions.
pub struct HistoryMiddleware {
    handle: HistoryHandle,
}

impl HistoryMiddleware {
    /// Create the middleware and the handle used to read its history.
    pub fn new(capacity: usize) -> (Self, HistoryHandle) {
        let handle = HistoryHandle {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_seq: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        };
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<S: Reducer> Middleware<S> for HistoryMiddleware {
    fn handle(&self, _store: &Store<S>, action: S::Action, next: Next<'_, S>) -> Result<()> {
        // Recorded up front so nested dispatches keep their order.
        let seq = self.handle.push(HistoryRecord {
            action_type: action.action_type(),
            payload: serde_json::to_value(&action).unwrap_or(Value::Null),
            at: Utc::now(),
            error: None,
            seq: 0,
        });
        let result = next.run(action);
        if let Err(e) = &result {
            self.handle.mark_failed(seq, e);
        }
        result
    }
}
