use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What an SLA rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaType {
    /// The flow must finish, in any terminal state, within the window.
    FlowFinish,
    /// The flow must finish successfully within the window.
    FlowSucceed,
    /// A named job must finish within the window of its own start.
    JobFinish,
    /// A named job must succeed within the window of its own start.
    JobSucceed,
}

impl SlaType {
    pub fn is_flow_level(self) -> bool {
        matches!(self, SlaType::FlowFinish | SlaType::FlowSucceed)
    }

    pub fn requires_success(self) -> bool {
        matches!(self, SlaType::FlowSucceed | SlaType::JobSucceed)
    }
}

/// What happens when an SLA rule is violated. Alerting always happens;
/// kill actions are additional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaAction {
    Alert,
    KillFlow,
    KillJob,
}

/// One SLA rule attached to an execution at submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaOption {
    pub sla_type: SlaType,
    /// Nested id of the watched job; None for flow-level rules.
    pub job_id: Option<String>,
    pub duration_ms: u64,
    pub actions: Vec<SlaAction>,
    pub alert_emails: Vec<String>,
}

impl SlaOption {
    pub fn flow_finish(duration: Duration, actions: Vec<SlaAction>) -> Self {
        Self {
            sla_type: SlaType::FlowFinish,
            job_id: None,
            duration_ms: duration.as_millis() as u64,
            actions,
            alert_emails: Vec::new(),
        }
    }

    pub fn flow_succeed(duration: Duration, actions: Vec<SlaAction>) -> Self {
        Self {
            sla_type: SlaType::FlowSucceed,
            job_id: None,
            duration_ms: duration.as_millis() as u64,
            actions,
            alert_emails: Vec::new(),
        }
    }

    pub fn job_finish(job_id: impl Into<String>, duration: Duration, actions: Vec<SlaAction>) -> Self {
        Self {
            sla_type: SlaType::JobFinish,
            job_id: Some(job_id.into()),
            duration_ms: duration.as_millis() as u64,
            actions,
            alert_emails: Vec::new(),
        }
    }

    pub fn job_succeed(job_id: impl Into<String>, duration: Duration, actions: Vec<SlaAction>) -> Self {
        Self {
            sla_type: SlaType::JobSucceed,
            job_id: Some(job_id.into()),
            duration_ms: duration.as_millis() as u64,
            actions,
            alert_emails: Vec::new(),
        }
    }

    pub fn emails<I, S>(mut self, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alert_emails = emails.into_iter().map(Into::into).collect();
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn has_action(&self, action: SlaAction) -> bool {
        self.actions.contains(&action)
    }

    /// Human-readable description for alert bodies and logs.
    pub fn describe(&self, flow_id: &str, execution_id: i64) -> String {
        let target = match &self.job_id {
            Some(job) => format!("job '{job}'"),
            None => format!("flow '{flow_id}'"),
        };
        let verb = if self.sla_type.requires_success() {
            "succeed"
        } else {
            "finish"
        };
        format!(
            "{target} of execution {execution_id} did not {verb} within {}s",
            self.duration().as_secs()
        )
    }
}
