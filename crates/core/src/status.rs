use serde::{Deserialize, Serialize};

/// Lifecycle status shared by executable nodes and flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Eligible to run once upstream dependencies allow it.
    Ready,
    /// Excluded from execution before the run started; becomes Skipped.
    Disabled,
    /// Admitted to the job pool, waiting for a worker slot.
    Queued,
    Running,
    /// Flow-level only; nodes are never paused individually.
    Paused,
    /// Cancellation requested, waiting for the work to stop.
    Killing,
    Killed,
    /// Never started because the run can no longer use it.
    Cancelled,
    /// Disabled node observed during traversal.
    Skipped,
    Failed,
    /// Flow-level only; a node failed but running work is finishing.
    FailedFinishing,
    /// Failed node absorbed by its succeed-on-failure option.
    FailedSucceeded,
    Succeeded,
}

impl Status {
    /// Terminal states. A finished node never changes status again
    /// except through a retry reset.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Status::Failed
                | Status::Killed
                | Status::Cancelled
                | Status::Skipped
                | Status::FailedSucceeded
                | Status::Succeeded
        )
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            Status::Running | Status::FailedFinishing | Status::Queued
        )
    }

    /// States that count against an all-success join.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Killed | Status::Cancelled)
    }

    /// Terminal states that satisfy a success-requiring join. Skipped
    /// nodes do not block their dependents.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::FailedSucceeded | Status::Skipped
        )
    }

    /// A node in any of these states must not be dispatched again.
    pub fn not_ready_to_run(self) -> bool {
        self.is_finished() || self.is_running() || self == Status::Killing
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Ready => "READY",
            Status::Disabled => "DISABLED",
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Killing => "KILLING",
            Status::Killed => "KILLED",
            Status::Cancelled => "CANCELLED",
            Status::Skipped => "SKIPPED",
            Status::Failed => "FAILED",
            Status::FailedFinishing => "FAILED_FINISHING",
            Status::FailedSucceeded => "FAILED_SUCCEEDED",
            Status::Succeeded => "SUCCEEDED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_states_are_terminal() {
        for s in [
            Status::Failed,
            Status::Killed,
            Status::Cancelled,
            Status::Skipped,
            Status::FailedSucceeded,
            Status::Succeeded,
        ] {
            assert!(s.is_finished(), "{s} should be finished");
            assert!(s.not_ready_to_run());
        }
        assert!(!Status::Ready.is_finished());
        assert!(!Status::FailedFinishing.is_finished());
    }

    #[test]
    fn failed_succeeded_counts_as_success() {
        assert!(Status::FailedSucceeded.is_success());
        assert!(!Status::FailedSucceeded.is_failure());
    }

    #[test]
    fn killing_blocks_dispatch_without_being_finished() {
        assert!(Status::Killing.not_ready_to_run());
        assert!(!Status::Killing.is_finished());
    }
}
