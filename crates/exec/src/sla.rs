//! SLA enforcement for running executions.
//!
//! Each SLA option on a flow becomes one watch task. Flow-level rules
//! measure from registration, job-level rules from the watched job's
//! actual start. Violations always alert; kill actions are applied on
//! top through the runner handle.

use flowdeck_core::{Alerter, SlaAction, SlaOption, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::flow_runner::FlowRunnerHandle;

const SLA_USER: &str = "sla";

pub struct TriggerManager {
    alerter: Arc<dyn Alerter>,
    poll_interval: Duration,
}

impl TriggerManager {
    pub fn new(alerter: Arc<dyn Alerter>) -> Self {
        Self {
            alerter,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Start one watch task per SLA option of the execution.
    pub fn register(&self, handle: &FlowRunnerHandle, options: &[SlaOption]) -> Vec<JoinHandle<()>> {
        options
            .iter()
            .map(|option| {
                let watch = SlaWatch {
                    alerter: self.alerter.clone(),
                    handle: handle.clone(),
                    option: option.clone(),
                    poll_interval: self.poll_interval,
                };
                tokio::spawn(async move { watch.run().await })
            })
            .collect()
    }
}

struct SlaWatch {
    alerter: Arc<dyn Alerter>,
    handle: FlowRunnerHandle,
    option: SlaOption,
    poll_interval: Duration,
}

impl SlaWatch {
    async fn run(self) {
        if self.option.sla_type.is_flow_level() {
            self.watch_flow().await;
        } else {
            self.watch_job().await;
        }
    }

    async fn watch_flow(&self) {
        tokio::select! {
            _ = self.handle.wait_finished() => {
                if self.option.sla_type.requires_success()
                    && self.handle.status().await != Status::Succeeded
                {
                    self.violate().await;
                }
            }
            _ = tokio::time::sleep(self.option.duration()) => {
                self.violate().await;
            }
        }
    }

    async fn watch_job(&self) {
        let Some(job_id) = self.option.job_id.clone() else {
            tracing::warn!(sla = ?self.option.sla_type, "job-level SLA without a job id");
            return;
        };
        // The window opens when the job actually starts.
        let started = loop {
            if let Some(started) = self.handle.node_start_time(&job_id).await {
                break started;
            }
            if self.handle.is_finished() {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        let deadline = tokio::time::Instant::now()
            + self
                .option
                .duration()
                .saturating_sub(elapsed_since(started));
        loop {
            if let Some(status) = self.handle.node_status(&job_id).await {
                if status.is_finished() {
                    if self.option.sla_type.requires_success() && !status.is_success() {
                        self.violate().await;
                    }
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.violate().await;
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn violate(&self) {
        let message = self
            .option
            .describe(self.handle.flow_id(), self.handle.execution_id());
        tracing::warn!(
            execution_id = self.handle.execution_id(),
            sla = ?self.option.sla_type,
            "SLA violated: {message}"
        );
        self.alerter.alert_sla(&self.option, &message).await;
        if self.option.has_action(SlaAction::KillFlow) {
            self.handle.kill(SLA_USER).await;
        }
        if self.option.has_action(SlaAction::KillJob) {
            if let Some(job_id) = &self.option.job_id {
                if !self.handle.kill_job(job_id, true).await {
                    tracing::warn!(
                        execution_id = self.handle.execution_id(),
                        job = %job_id,
                        "SLA kill requested for a job that is not active"
                    );
                }
            }
        }
    }
}

fn elapsed_since(started: chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - started).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_runner::{FlowRunner, FlowRunnerSettings};
    use async_trait::async_trait;
    use flowdeck_core::{
        ExecutableFlow, ExecutionOptions, FlowBuilder, Job, JobContext, JobTypeRegistry,
        MemoryFlowStore, NodeSpec, Props,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct SleepyJob {
        ms: u64,
        cancelled: Notify,
    }

    #[async_trait]
    impl Job for SleepyJob {
        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<Props> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.ms)) => Ok(Props::new()),
                _ = self.cancelled.notified() => anyhow::bail!("cancelled"),
            }
        }

        fn cancel(&self) {
            self.cancelled.notify_waiters();
        }
    }

    #[derive(Default)]
    struct CountingAlerter {
        sla: AtomicUsize,
    }

    #[async_trait]
    impl Alerter for CountingAlerter {
        async fn alert_first_error(&self, _flow: &ExecutableFlow) {}
        async fn alert_flow_finished(&self, _flow: &ExecutableFlow) {}
        async fn alert_sla(&self, _option: &SlaOption, _message: &str) {
            self.sla.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sleepy_flow(sla: SlaOption, ms: u64) -> ExecutableFlow {
        FlowBuilder::new("slow")
            .node(NodeSpec::job("a", "sleepy").props(Props::new().with("ms", ms.to_string())))
            .sla(sla)
            .build(1, "alice", ExecutionOptions::default())
            .unwrap()
    }

    async fn run_with_sla(
        flow: ExecutableFlow,
    ) -> (ExecutableFlow, Arc<CountingAlerter>) {
        let registry = JobTypeRegistry::new();
        registry.register("sleepy", |props| {
            Ok(Arc::new(SleepyJob {
                ms: props.get_u64("ms", 0),
                cancelled: Notify::new(),
            }) as Arc<dyn Job>)
        });
        let alerter = Arc::new(CountingAlerter::default());
        let dir = TempDir::new().unwrap();
        let options = flow.sla_options.clone();
        let (runner, handle) = FlowRunner::new(
            flow,
            dir.path().join("1"),
            Arc::new(MemoryFlowStore::new()),
            Arc::new(registry),
            alerter.clone(),
            FlowRunnerSettings::default(),
        )
        .unwrap();
        let triggers = TriggerManager::new(alerter.clone());
        triggers.register(&runner.handle(), &options);
        let task = tokio::spawn(runner.run());
        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        (handle.snapshot().await, alerter)
    }

    #[tokio::test]
    async fn flow_finish_violation_kills_flow() {
        let sla = SlaOption::flow_finish(
            Duration::from_millis(100),
            vec![SlaAction::Alert, SlaAction::KillFlow],
        );
        let (flow, alerter) = run_with_sla(sleepy_flow(sla, 10_000)).await;
        assert_eq!(flow.status, Status::Killed);
        assert_eq!(alerter.sla.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn job_finish_violation_kills_only_the_job() {
        let flow = FlowBuilder::new("mixed")
            .node(NodeSpec::job("slow", "sleepy").props(Props::new().with("ms", "10000")))
            .node(NodeSpec::job("quick", "sleepy").props(Props::new().with("ms", "10")))
            .sla(SlaOption::job_finish(
                "slow",
                Duration::from_millis(100),
                vec![SlaAction::Alert, SlaAction::KillJob],
            ))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (flow, alerter) = run_with_sla(flow).await;

        let slow = flow.node("slow").unwrap();
        assert_eq!(slow.status, Status::Killed);
        assert!(slow.killed_by_sla);
        assert_eq!(flow.node("quick").unwrap().status, Status::Succeeded);
        // a job killed by SLA takes the flow down with it
        assert_eq!(flow.status, Status::Killed);
        assert_eq!(alerter.sla.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn met_sla_stays_quiet() {
        let sla = SlaOption::flow_succeed(Duration::from_secs(10), vec![SlaAction::Alert]);
        let (flow, alerter) = run_with_sla(sleepy_flow(sla, 10)).await;
        assert_eq!(flow.status, Status::Succeeded);
        assert_eq!(alerter.sla.load(Ordering::SeqCst), 0);
    }
}
