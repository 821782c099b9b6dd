//! Synchronizer module
//!
//! Keeps backup mirrors in step with the primary buckets through two
//! persisted task queues worked in the background.

mod executor;
mod queue;
mod synchronizer;
mod task;

pub use executor::{BucketTaskExecutor, TaskExecutor};
pub use queue::{QueueSnapshot, QueueStats, TaskQueue};
pub use synchronizer::{SyncNotifier, Synchronizer};
pub use task::{task_id, QueueKind, Task, TaskKind, TaskState};
