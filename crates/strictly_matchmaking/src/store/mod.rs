//! Scoped string key/value storage.

mod error;
mod memory;
mod models;
mod schema; // Diesel generated schema - internal use only
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{KvEntry, NewKvEntry};
pub use sqlite::SqliteStore;

/// Get/set/remove of string values, namespaced by scope.
///
/// Implementations must be safe to share between tasks.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Reads `key` in `scope`.
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `key` in `scope`, replacing any previous value.
    fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deletes `key` in `scope`. Missing keys are not an error.
    fn remove(&self, scope: &str, key: &str) -> Result<(), StoreError>;
}
