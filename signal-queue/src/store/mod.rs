pub mod memory;
pub mod file;

pub use memory::MemoryStore;
pub use file::FileStore;

use crate::error::StoreError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value persistence used to survive process restarts.
///
/// Calls are synchronous: the queue writes its full snapshot on every
/// mutation while holding its own lock, so writes land in mutation order.
pub trait Store: Send + Sync {
    /// Overwrite the value stored under `key`
    fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Read the value stored under `key`, if any
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
}
