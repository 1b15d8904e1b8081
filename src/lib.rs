//! # caseboard-sync
//!
//! Client-side data synchronization core for the caseboard dashboard.
//!
//! - **State container**: [`Store`] holds an immutable root, runs actions
//!   through [`Middleware`] and notifies subscribers on change.
//! - **Query cache**: [`QueryCache`] de-duplicates, retries and expires
//!   server reads keyed by hierarchical [`QueryKey`]s.
//! - **Realtime sync**: [`RealtimeSync`] keeps a socket open, reconnects
//!   with a bounded linear back-off and invalidates cached queries when
//!   the server reports a change.
//! - **Optimistic updates**: [`OptimisticManager`] applies a speculative
//!   write, then confirms, rolls back or resolves it with a conflict
//!   [`Strategy`].
//! - **Persistence**: [`Persister`] writes selected slices through to a
//!   [`KeyValueStorage`] ([`SqliteStorage`] or [`MemoryStorage`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use caseboard_sync::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> caseboard_sync::Result<()> {
//!     let cache = QueryCache::new();
//!     let opts = cache.default_options();
//!
//!     let cases: Value = cache
//!         .fetch_query(
//!             QueryKey::list("cases"),
//!             || async { Ok::<_, String>(json!([{"id": 1, "title": "Intake"}])) },
//!             opts,
//!         )
//!         .await?;
//!     println!("{}", cases);
//!
//!     // A later change notification marks the list stale.
//!     cache.invalidate_queries(QueryKey::entity("cases"));
//!     Ok(())
//! }
//! ```
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use caseboard_sync::prelude::*;
//! use caseboard_sync::{app, logging};
//!
//! #[tokio::main]
//! async fn main() -> caseboard_sync::Result<()> {
//!     let config = SyncConfig::load(None)?;
//!     logging::init(&config.log)?;
//!
//!     let store = Store::builder(AppState::default())
//!         .middleware(LoggerMiddleware)
//!         .build();
//!     let persister = Persister::open(&config.persist).await?;
//!     persister.load(&store).await?;
//!     let _persist = persister.attach(&store);
//!
//!     let cache = QueryCache::from_config(&config.cache);
//!     let sync = RealtimeSync::websocket(config.realtime.clone(), cache.clone());
//!     let _bridge = app::bridge_connection_state(&sync, &store);
//!     sync.connect();
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod conflict;
pub mod error;
pub mod logging;
pub mod mask;
pub mod middleware;
pub mod optimistic;
pub mod persist;
pub mod query;
pub mod realtime;
pub mod slice;
pub mod slices;
pub mod store;
pub mod subscription;
pub mod time;

// Re-export main types
pub use app::{AppAction, AppState};
pub use config::SyncConfig;
pub use conflict::{resolve, Strategy};
pub use error::{CallbackResult, Result, SyncError};
pub use mask::Masked;
pub use middleware::{HistoryMiddleware, LoggerMiddleware, Middleware};
pub use optimistic::OptimisticManager;
pub use persist::{KeyValueStorage, MemoryStorage, Persister, SqliteStorage};
pub use query::{QueryCache, QueryKey, QueryObserver, QueryOptions, QueryState};
pub use realtime::{ConnectionState, RealtimeSync, SyncEvent, SyncEventType};
pub use store::{Action, Reducer, Store};
pub use subscription::Subscription;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::app::{AppAction, AppState};
    pub use crate::config::SyncConfig;
    pub use crate::conflict::Strategy;
    pub use crate::error::{CallbackResult, Result, SyncError};
    pub use crate::middleware::{HistoryMiddleware, LoggerMiddleware, Middleware};
    pub use crate::optimistic::OptimisticManager;
    pub use crate::persist::{KeyValueStorage, MemoryStorage, Persister, SqliteStorage};
    pub use crate::query::{QueryCache, QueryKey, QueryOptions, QueryState};
    pub use crate::realtime::{ConnectionState, RealtimeSync, SyncEvent, SyncEventType};
    pub use crate::store::{Action, Reducer, Store};
    pub use crate::subscription::Subscription;
}
