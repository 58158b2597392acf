use thiserror::Error;

/// Errors surfaced by the executor and its storage seams.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("execution {0} is not running on this executor")]
    NotRunning(i64),

    #[error("execution {0} not found")]
    FlowNotFound(i64),

    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error("executor is not accepting new executions")]
    Inactive,

    #[error("unknown job type: {0}")]
    JobType(String),

    #[error("storage error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("preparation failed: {0}")]
    Prepare(#[source] anyhow::Error),
}
