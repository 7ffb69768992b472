//! Phase-aware task queue with dependency gating and retry scheduling.

mod queue;
mod task;

pub use queue::{QueueStatistics, TaskQueue};
pub use task::{Priority, Task, TaskStatus};
