/// The error value handed to a task's catch handler.
///
/// Nothing here crosses back to the caller of `schedule`: once a task is
/// admitted, every lifecycle error ends up in its catch handler (or is
/// logged and dropped when none is installed).
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// The task's context was already done when a worker picked it up; the
    /// body never ran.
    #[error("task cancelled")]
    Cancelled,

    /// A start or finish callback returned an error. Advisory: the rest of
    /// the lifecycle still runs.
    #[error("callback failed: {0}")]
    Callback(anyhow::Error),

    /// The task body returned an error and no retry budget was left to
    /// swallow it.
    #[error("task body failed: {0}")]
    Body(anyhow::Error),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}
