use crate::props::Props;
use serde::{Deserialize, Serialize};

/// What the flow does after its first job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    /// Let running jobs complete, cancel everything not yet started.
    #[default]
    FinishCurrentlyRunning,
    /// Kill running jobs immediately.
    CancelAll,
    /// Keep dispatching jobs whose dependencies still allow them.
    FinishAllPossible,
}

/// Per-execution options chosen at submit time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub failure_action: FailureAction,
    /// Overrides layered on top of the flow input props.
    pub flow_parameters: Props,
    /// Execution id whose progress gates this run's jobs.
    pub pipeline_execution_id: Option<i64>,
    /// 1 = same job, 2 = downstream frontier, 3 = whole watched flow.
    pub pipeline_level: Option<u8>,
    /// Cap on concurrently running jobs within this flow.
    pub num_job_threads: Option<usize>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }
}
