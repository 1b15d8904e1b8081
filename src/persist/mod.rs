//! Local persistence of state slices.

mod memory;
mod persister;
mod sqlite;
mod storage;

pub use memory::MemoryStorage;
pub use persister::{PersistHandle, Persistable, Persister};
pub use sqlite::SqliteStorage;
pub use storage::{validate_key, KeyValueStorage, StoredValue, MAX_KEY_LENGTH};
