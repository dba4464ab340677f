//! A worker-pool task scheduler.
//!
//! Tasks are admitted to an ordered queue (FIFO by default, comparator-driven
//! otherwise) and executed by a fixed pool of worker threads. The queue
//! suppresses re-entrancy: scheduling the same task handle again while it is
//! queued is a no-op, and scheduling it while it runs only records the intent
//! to run it once more. Tasks carry optional lifecycle decorations: timeout,
//! cancellation, retry budget, priority, start/finish callbacks and a catch
//! handler that receives every post-admission error.

pub mod context;

pub mod queue;

pub mod scheduler;

pub mod task;

pub(crate) mod utils;

pub use context::{CancelHandle, Context};
pub use queue::{CompareFn, Queue, compare_by_deadline, compare_by_priority};
pub use scheduler::{Builder, Scheduler, SchedulerError};
pub use task::{ScriptTask, Task, TaskError, Work};
