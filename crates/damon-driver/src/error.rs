use damon::container::ContainerError;

/// Driver-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No task with the given ID.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A task with the given ID is already registered.
    #[error("task with ID '{0}' is already running")]
    DuplicateTask(String),

    /// The operation refuses to act on a running task.
    #[error("cannot destroy running task: {0}")]
    StillRunning(String),

    /// A task or driver configuration field failed validation.
    #[error("driver config: {0}")]
    Config(String),

    /// The containment engine failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Metrics plumbing failed.
    #[error("metrics: {0}")]
    Metrics(String),
}
