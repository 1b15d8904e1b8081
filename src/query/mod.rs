//! Query cache: keyed asynchronous results with de-duplication, retry,
//! staleness, invalidation and collection of unobserved entries.

mod cache;
mod key;
mod observer;
mod options;
mod state;

pub use cache::QueryCache;
pub use key::QueryKey;
pub use observer::QueryObserver;
pub use options::QueryOptions;
pub use state::{QueryEvent, QueryState};
