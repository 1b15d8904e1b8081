//! Realtime sync manager.
//!
//! Owns one connection at a time. Every connect, reconnect and disconnect
//! starts a new epoch; tasks and timers belonging to an older epoch find
//! it superseded and exit without touching state, so a pending reconnect
//! can never race an intentional disconnect.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{CallbackResult, SyncError};
use crate::query::{QueryCache, QueryKey};
use crate::realtime::event::{EventStream, SyncEvent, SyncEventType};
use crate::realtime::state::ConnectionState;
use crate::realtime::transport::{ConnectRequest, Transport, TransportEvent};
use crate::realtime::websocket::WebSocketTransport;
use crate::subscription::Subscription;

type Handler = Arc<dyn Fn(&SyncEvent) -> CallbackResult + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&SyncError) -> CallbackResult + Send + Sync>;

const EVENT_CAPACITY: usize = 256;
const PING: &str = r#"{"type":"ping"}"#;

struct Inner {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    cache: QueryCache,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    error_handlers: Mutex<Vec<(u64, ErrorHandler)>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.reconnect_timer.get_mut().take() {
            timer.abort();
        }
        if let Some(task) = self.connection_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Keeps the query cache in step with server pushes.
#[derive(Clone)]
pub struct RealtimeSync {
    inner: Arc<Inner>,
}

impl RealtimeSync {
    pub fn new(config: RealtimeConfig, transport: impl Transport + 'static, cache: QueryCache) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
                cache,
                state,
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(HashMap::new()),
                error_handlers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                connection_task: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
                events,
            }),
        }
    }

    /// Manager using [`WebSocketTransport`].
    pub fn websocket(config: RealtimeConfig, cache: QueryCache) -> Self {
        Self::new(config, WebSocketTransport::new(), cache)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Open the connection, resetting the reconnect budget. Must be called
    /// within a Tokio runtime. No-op while connecting or connected.
    pub fn connect(&self) {
        if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Connected) {
            debug!(state = %self.state(), "connect ignored");
            return;
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.cancel_reconnect();
        self.start_connect();
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_reconnect();
        self.inner.outbound.lock().take();
        if let Some(task) = self.inner.connection_task.lock().take() {
            task.abort();
        }
        if self.transition(ConnectionState::Disconnected) {
            info!(url = %self.inner.config.url, "realtime disconnected");
        }
    }

    /// Serialize and send a message. Returns false, with a warning, unless
    /// connected with a live outbound channel.
    pub fn send<T: Serialize>(&self, data: &T) -> bool {
        if !self.state().is_connected() {
            warn!(state = %self.state(), "send while not connected, message dropped");
            return false;
        }
        let text = match serde_json::to_string(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "message could not be serialized");
                return false;
            }
        };
        let sent = match self.inner.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(text).is_ok(),
            None => false,
        };
        if !sent {
            warn!("outbound channel closed, message dropped");
        }
        sent
    }

    /// Run `handler` for every event about `entity`.
    pub fn register_handler<F>(&self, entity: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> CallbackResult + Send + Sync + 'static,
    {
        let entity = entity.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(entity.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(entity = %entity, "sync handler registered");

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut handlers = inner.handlers.lock();
            if let Some(set) = handlers.get_mut(&entity) {
                set.retain(|(hid, _)| *hid != id);
                if set.is_empty() {
                    handlers.remove(&entity);
                }
            }
        })
    }

    /// Run `handler` for every connection error.
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncError) -> CallbackResult + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.error_handlers.lock().push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.error_handlers.lock().retain(|(hid, _)| *hid != id);
            }
        })
    }

    pub fn handler_count(&self, entity: &str) -> usize {
        self.inner.handlers.lock().get(entity).map_or(0, Vec::len)
    }

    /// Events after handlers and invalidation ran, for `entity` or all.
    pub fn event_stream(&self, entity: Option<&str>) -> EventStream {
        EventStream::new(self.inner.events.subscribe(), entity.map(str::to_string))
    }

    /// Process one event as if the server had pushed it: entity handlers
    /// first, then cache invalidation.
    pub fn handle_event(&self, event: &SyncEvent) {
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .get(&event.entity)
            .map(|set| set.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler(event) {
                error!(entity = %event.entity, error = %e, "sync handler failed");
            }
        }

        let cache = &self.inner.cache;
        let invalidated = match event.event_type {
            SyncEventType::Sync => cache.invalidate_queries(QueryKey::entity(&event.entity)),
            SyncEventType::Create | SyncEventType::Update | SyncEventType::Delete => {
                let mut count = cache.invalidate_queries(QueryKey::list(&event.entity));
                if let Some(id) = event.item_id() {
                    count += cache.invalidate_queries(QueryKey::detail(&event.entity, id.clone()));
                }
                count
            }
        };
        debug!(
            entity = %event.entity,
            event_type = ?event.event_type,
            invalidated,
            "sync event processed"
        );

        let _ = self.inner.events.send(event.clone());
    }

    fn handle_message(&self, text: &str) {
        match serde_json::from_str::<SyncEvent>(text) {
            Ok(event) => self.handle_event(&event),
            Err(e) => debug!(error = %e, "skipping unparseable message"),
        }
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        self.inner.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                warn!(from = %state, to = %next, "illegal connection transition ignored");
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });
        match from {
            Some(from) => {
                debug!(from = %from, to = %next, "connection state changed");
                true
            }
            None => false,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    fn cancel_reconnect(&self) {
        if let Some(timer) = self.inner.reconnect_timer.lock().take() {
            timer.abort();
            debug!("pending reconnect cancelled");
        }
    }

    fn start_connect(&self) {
        if !self.transition(ConnectionState::Connecting) {
            return;
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(url = %self.inner.config.url, epoch, "connecting");
        let task = tokio::spawn(run_connection(Arc::downgrade(&self.inner), epoch));
        if let Some(previous) = self.inner.connection_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn opened(&self, outbound: mpsc::UnboundedSender<String>) {
        self.inner.attempts.store(0, Ordering::SeqCst);
        *self.inner.outbound.lock() = Some(outbound);
        self.transition(ConnectionState::Connected);
        info!(url = %self.inner.config.url, "realtime connected");
    }

    fn failed(&self, epoch: u64, err: SyncError) {
        warn!(error = %err, "realtime connection error");
        let handlers: Vec<ErrorHandler> = self
            .inner
            .error_handlers
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            if let Err(e) = handler(&err) {
                error!(error = %e, "error handler failed");
            }
        }
        self.closed(epoch);
    }

    fn closed(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        self.inner.outbound.lock().take();

        let max = self.inner.config.max_reconnect_attempts;
        let attempt = self.inner.attempts.load(Ordering::SeqCst);
        if attempt >= max {
            warn!(attempts = attempt, "reconnect attempts exhausted");
            self.transition(ConnectionState::Disconnected);
            return;
        }

        let attempt = attempt + 1;
        self.inner.attempts.store(attempt, Ordering::SeqCst);
        self.transition(ConnectionState::Reconnecting);

        let delay = reconnect_delay(&self.inner.config, attempt);
        info!(attempt, max, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let sync = RealtimeSync { inner };
                if sync.is_current(epoch) {
                    sync.start_connect();
                }
            }
        });
        if let Some(previous) = self.inner.reconnect_timer.lock().replace(timer) {
            previous.abort();
        }
    }
}

impl fmt::Debug for RealtimeSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSync")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

async fn run_connection(weak: Weak<Inner>, epoch: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let transport = inner.transport.clone();
    let request = ConnectRequest {
        url: inner.config.url.clone(),
        token: inner.config.token.clone(),
    };
    let heartbeat = inner.config.heartbeat_interval();
    drop(inner);

    let result = transport.connect(&request).await;

    let Some(inner) = weak.upgrade() else {
        return;
    };
    let sync = RealtimeSync { inner };
    if !sync.is_current(epoch) {
        return;
    }
    let mut handle = match result {
        Ok(handle) => handle,
        Err(e) => {
            sync.failed(epoch, e);
            return;
        }
    };
    sync.opened(handle.outbound.clone());
    drop(sync);

    let mut ticker = heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let event = tokio::select! {
            event = handle.inbound.recv() => event,
            _ = next_tick(&mut ticker) => {
                if handle.outbound.send(PING.to_string()).is_err() {
                    None
                } else {
                    continue;
                }
            }
        };

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let sync = RealtimeSync { inner };
        if !sync.is_current(epoch) {
            return;
        }
        match event {
            Some(TransportEvent::Message(text)) => sync.handle_message(&text),
            Some(TransportEvent::Error(message)) => {
                sync.failed(epoch, SyncError::Connection(message));
                return;
            }
            Some(TransportEvent::Closed) | None => {
                info!("realtime connection closed");
                sync.closed(epoch);
                return;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(config: &RealtimeConfig, attempt: u32) -> Duration {
    config.reconnect_delay().saturating_mul(attempt)
}
