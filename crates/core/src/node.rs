use crate::condition::ConditionOnJobStatus;
use crate::props::Props;
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an executable node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Job {
        job_type: String,
    },
    /// An embedded flow. Children are stored in the flat node arena and
    /// referenced here by nested id.
    Flow {
        children: Vec<String>,
        start_nodes: Vec<String>,
        end_nodes: Vec<String>,
    },
}

/// One node of an executable flow: a job or an embedded flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableNode {
    /// Short id, unique within its enclosing flow.
    pub id: String,
    /// Scope-qualified id, unique within the whole execution.
    pub nested_id: String,
    pub kind: NodeKind,
    /// Nested id of the enclosing flow node; None at the top level.
    pub parent: Option<String>,
    pub in_nodes: Vec<String>,
    pub out_nodes: Vec<String>,
    pub condition_on_job_status: ConditionOnJobStatus,
    /// Optional runtime expression gating dispatch.
    pub condition: Option<String>,
    pub status: Status,
    pub attempt: u32,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub delay_ms: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    /// Job-level overrides, the last layer of the input props.
    pub override_props: Props,
    /// Resolved input, materialized just before dispatch.
    pub input_props: Props,
    pub output_props: Props,
    pub failure_message: Option<String>,
    pub killed_by_sla: bool,
}

impl ExecutableNode {
    pub fn is_flow(&self) -> bool {
        matches!(self.kind, NodeKind::Flow { .. })
    }

    pub fn job_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Job { job_type } => Some(job_type),
            NodeKind::Flow { .. } => None,
        }
    }

    pub fn set_status(&mut self, status: Status, now: DateTime<Utc>) {
        self.status = status;
        self.update_time = Some(now);
    }

    /// Retries remain for this node. Embedded flows never retry as a unit.
    pub fn can_retry(&self) -> bool {
        !self.is_flow() && self.attempt < self.retries
    }

    /// Reset for another attempt. The next dispatch waits out the retry
    /// backoff before starting.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.attempt += 1;
        self.status = Status::Ready;
        self.start_time = None;
        self.end_time = None;
        self.update_time = Some(now);
        self.output_props = Props::new();
        self.failure_message = None;
        self.killed_by_sla = false;
        self.delay_ms = self.retry_backoff_ms;
    }

    /// Mark a node that will never start in this run.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if self.end_time.is_none() {
            self.end_time = Some(now);
        }
        self.set_status(Status::Cancelled, now);
    }

    /// Mark a disabled node as observed by the traversal.
    pub fn skip(&mut self, now: DateTime<Utc>) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if self.end_time.is_none() {
            self.end_time = Some(now);
        }
        self.set_status(Status::Skipped, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ExecutableNode {
        ExecutableNode {
            id: "a".into(),
            nested_id: "a".into(),
            kind: NodeKind::Job {
                job_type: "test".into(),
            },
            parent: None,
            in_nodes: vec![],
            out_nodes: vec![],
            condition_on_job_status: ConditionOnJobStatus::AllSuccess,
            condition: None,
            status: Status::Ready,
            attempt: 0,
            retries: 2,
            retry_backoff_ms: 500,
            delay_ms: 0,
            start_time: None,
            end_time: None,
            update_time: None,
            override_props: Props::new(),
            input_props: Props::new(),
            output_props: Props::new(),
            failure_message: None,
            killed_by_sla: false,
        }
    }

    #[test]
    fn retry_reset_clears_terminal_state() {
        let now = Utc::now();
        let mut n = node();
        n.set_status(Status::Failed, now);
        n.end_time = Some(now);
        n.output_props.put("x", "1");
        n.failure_message = Some("boom".into());

        assert!(n.can_retry());
        n.reset_for_retry(now);
        assert_eq!(n.status, Status::Ready);
        assert_eq!(n.attempt, 1);
        assert!(n.end_time.is_none());
        assert!(n.output_props.is_empty());
        assert!(n.failure_message.is_none());
        assert_eq!(n.delay_ms, 500);
    }

    #[test]
    fn retries_exhaust() {
        let now = Utc::now();
        let mut n = node();
        n.reset_for_retry(now);
        n.reset_for_retry(now);
        assert!(!n.can_retry());
    }
}
