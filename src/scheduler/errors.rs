/// Errors returned to callers of the scheduler surface.
///
/// Everything that happens after a task is admitted surfaces through the
/// task's catch handler instead; see `TaskError`.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// `schedule` was called after `stop`.
    #[error("scheduler stopped")]
    Stopped,

    /// A comparator was requested while tasks were queued or running.
    #[error("queue is not empty, comparators can only be installed before tasks are admitted")]
    NotEmpty,
}
