//! Reactive state container.
//!
//! A [`Store`] owns one immutable root value behind an `Arc`. Every update
//! produces a new root; subscribers are notified only when the new root is
//! not pointer-equal to the previous one, so reducers signal "no change" by
//! handing the old `Arc` back.
//!
//! Dispatched actions pass through the middleware chain in registration
//! order before reaching the root reducer.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

use crate::error::{CallbackResult, Result, SyncError};
use crate::middleware::{Middleware, Next};
use crate::subscription::Subscription;

/// An intent to change state. Plain data: no closures, no live references.
pub trait Action: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Namespaced type, e.g. `"ui/setTheme"`.
    fn action_type(&self) -> String;
}

/// A root state type and its reducer.
pub trait Reducer: Send + Sync + 'static {
    /// The action vocabulary accepted by this root.
    type Action: Action;

    /// Compute the next root. Returning a clone of `state` means "unchanged".
    fn reduce(state: &Arc<Self>, action: &Self::Action) -> Arc<Self>;
}

type Listener<S> = Arc<dyn Fn(&Arc<S>) -> CallbackResult + Send + Sync>;

struct StoreInner<S: Reducer> {
    state: RwLock<Arc<S>>,
    /// Held for the duration of an updater/reducer call; the flag inside
    /// detects same-thread nesting.
    updating: ReentrantMutex<Cell<bool>>,
    listeners: Mutex<Vec<(u64, Listener<S>)>>,
    next_listener_id: AtomicU64,
    middleware: Arc<[Arc<dyn Middleware<S>>]>,
}

/// Resets the updating flag even if the updater panics.
struct UpdatingFlag<'a>(&'a Cell<bool>);

impl<'a> UpdatingFlag<'a> {
    fn raise(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for UpdatingFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// The state container. Cheap to clone; clones share the same state.
pub struct Store<S: Reducer> {
    inner: Arc<StoreInner<S>>,
}

impl<S: Reducer> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Reducer> Store<S> {
    /// Create a store without middleware.
    pub fn new(initial: S) -> Self {
        Self::builder(initial).build()
    }

    /// Start building a store with middleware.
    pub fn builder(initial: S) -> StoreBuilder<S> {
        StoreBuilder {
            initial,
            middleware: Vec::new(),
        }
    }

    /// Current root state.
    pub fn get_state(&self) -> Arc<S> {
        self.inner.state.read().clone()
    }

    /// Replace the root with the updater's result.
    ///
    /// Fails with [`SyncError::Reentrancy`] when called from inside another
    /// updater or reducer on the same thread.
    pub fn set_state<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        self.commit(updater).map(|_| ())
    }

    /// Send an action through the middleware chain to the root reducer.
    pub fn dispatch(&self, action: S::Action) -> Result<()> {
        let chain = self.inner.middleware.clone();
        Next::new(self, &chain).run(action)
    }

    /// Register a listener called after every update that changes the root.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<S>) -> CallbackResult + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<StoreInner<S>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Register a listener for one slice of the root.
    ///
    /// The listener fires only when the selected `Arc` changes identity.
    pub fn subscribe_slice<T, Sel, F>(&self, selector: Sel, listener: F) -> Subscription
    where
        T: Send + Sync + 'static,
        Sel: Fn(&S) -> Arc<T> + Send + Sync + 'static,
        F: Fn(&Arc<T>) -> CallbackResult + Send + Sync + 'static,
    {
        let last = Mutex::new(selector(&*self.get_state()));
        self.subscribe(move |state| {
            let selected = selector(&**state);
            {
                let mut last = last.lock();
                if Arc::ptr_eq(&last, &selected) {
                    return Ok(());
                }
                *last = selected.clone();
            }
            listener(&selected)
        })
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Terminal step of the middleware chain.
    pub(crate) fn reduce(&self, action: S::Action) -> Result<()> {
        trace!(action = %action.action_type(), "reducing");
        self.commit(|state| S::reduce(state, &action)).map(|_| ())
    }

    /// Apply an update and notify listeners. Returns whether the root changed.
    fn commit<F>(&self, update: F) -> Result<bool>
    where
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        let next = {
            let gate = self.inner.updating.lock();
            if gate.get() {
                return Err(SyncError::Reentrancy);
            }
            let _flag = UpdatingFlag::raise(&gate);

            let prev = self.get_state();
            let next = update(&prev);
            if Arc::ptr_eq(&prev, &next) {
                return Ok(false);
            }
            *self.inner.state.write() = next.clone();
            next
        };

        self.notify(&next);
        Ok(true)
    }

    fn notify(&self, state: &Arc<S>) {
        let listeners: Vec<(u64, Listener<S>)> = self.inner.listeners.lock().clone();
        for (id, listener) in listeners {
            if let Err(e) = listener(state) {
                error!(listener = id, error = %e, "state listener failed");
            }
        }
    }
}

impl<S: Reducer + fmt::Debug> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.get_state())
            .field("listeners", &self.listener_count())
            .field("middleware", &self.inner.middleware.len())
            .finish()
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder<S: Reducer> {
    initial: S,
    middleware: Vec<Arc<dyn Middleware<S>>>,
}

impl<S: Reducer> StoreBuilder<S> {
    /// Append a middleware. The first one added sees each action first.
    pub fn middleware(mut self, middleware: impl Middleware<S> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Build the store.
    pub fn build(self) -> Store<S> {
        Store {
            inner: Arc::new(StoreInner {
                state: RwLock::new(Arc::new(self.initial)),
                updating: ReentrantMutex::new(Cell::new(false)),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                middleware: self.middleware.into(),
            }),
        }
    }
}
