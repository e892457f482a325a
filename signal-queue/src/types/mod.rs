pub mod ids;
pub mod entry;
pub mod stats;
pub mod events;

pub use ids::EntryId;
pub use entry::{EnqueueOptions, EntryStatus, QueueEntry};
pub use stats::{QueueStats, QueueStatus};
pub use events::{BreakerEvent, CircuitState, RetryEvent};
