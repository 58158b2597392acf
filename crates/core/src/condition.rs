use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Join predicate over a node's upstream dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOnJobStatus {
    #[default]
    AllSuccess,
    AllFailed,
    AllDone,
    OneSuccess,
    OneFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionResult {
    /// Upstream state cannot yet decide the join.
    Pending,
    Satisfied,
    /// The join can never be satisfied; the node is cancelled.
    Failed,
}

/// Evaluate a join predicate against the current upstream statuses.
///
/// The one-sided predicates short-circuit: OneSuccess satisfies as soon
/// as any qualifying upstream finishes, and only fails once every
/// upstream has finished without one. The all-sided predicates stay
/// Pending until every upstream is finished.
pub fn check_condition_on_job_status(
    condition: ConditionOnJobStatus,
    upstream: &[Status],
) -> ConditionResult {
    if upstream.is_empty() {
        return ConditionResult::Satisfied;
    }
    let all_finished = upstream.iter().all(|s| s.is_finished());
    match condition {
        ConditionOnJobStatus::AllDone => {
            if all_finished {
                ConditionResult::Satisfied
            } else {
                ConditionResult::Pending
            }
        }
        ConditionOnJobStatus::AllSuccess => {
            if !all_finished {
                ConditionResult::Pending
            } else if upstream.iter().all(|s| s.is_success()) {
                ConditionResult::Satisfied
            } else {
                ConditionResult::Failed
            }
        }
        ConditionOnJobStatus::AllFailed => {
            if !all_finished {
                ConditionResult::Pending
            } else if upstream.iter().all(|s| s.is_failure()) {
                ConditionResult::Satisfied
            } else {
                ConditionResult::Failed
            }
        }
        ConditionOnJobStatus::OneSuccess => {
            if upstream.iter().any(|s| s.is_success()) {
                ConditionResult::Satisfied
            } else if all_finished {
                ConditionResult::Failed
            } else {
                ConditionResult::Pending
            }
        }
        ConditionOnJobStatus::OneFailed => {
            if upstream.iter().any(|s| s.is_failure()) {
                ConditionResult::Satisfied
            } else if all_finished {
                ConditionResult::Failed
            } else {
                ConditionResult::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConditionOnJobStatus::*;
    use ConditionResult::*;

    #[test]
    fn no_upstream_is_satisfied() {
        assert_eq!(check_condition_on_job_status(AllSuccess, &[]), Satisfied);
    }

    #[test]
    fn all_success_waits_then_decides() {
        let cond = AllSuccess;
        assert_eq!(
            check_condition_on_job_status(cond, &[Status::Succeeded, Status::Running]),
            Pending
        );
        assert_eq!(
            check_condition_on_job_status(cond, &[Status::Succeeded, Status::Skipped]),
            Satisfied
        );
        assert_eq!(
            check_condition_on_job_status(cond, &[Status::Succeeded, Status::Failed]),
            Failed
        );
    }

    #[test]
    fn all_done_ignores_outcomes() {
        assert_eq!(
            check_condition_on_job_status(AllDone, &[Status::Failed, Status::Killed]),
            Satisfied
        );
        assert_eq!(
            check_condition_on_job_status(AllDone, &[Status::Failed, Status::Queued]),
            Pending
        );
    }

    #[test]
    fn one_success_short_circuits() {
        assert_eq!(
            check_condition_on_job_status(OneSuccess, &[Status::Succeeded, Status::Running]),
            Satisfied
        );
        assert_eq!(
            check_condition_on_job_status(OneSuccess, &[Status::Failed, Status::Running]),
            Pending
        );
        assert_eq!(
            check_condition_on_job_status(OneSuccess, &[Status::Failed, Status::Killed]),
            Failed
        );
    }

    #[test]
    fn one_failed_matches_cancelled() {
        assert_eq!(
            check_condition_on_job_status(OneFailed, &[Status::Cancelled, Status::Running]),
            Satisfied
        );
    }

    #[test]
    fn all_failed_rejects_mixed_outcomes() {
        assert_eq!(
            check_condition_on_job_status(AllFailed, &[Status::Failed, Status::Succeeded]),
            Failed
        );
        assert_eq!(
            check_condition_on_job_status(AllFailed, &[Status::Failed, Status::Killed]),
            Satisfied
        );
    }
}
