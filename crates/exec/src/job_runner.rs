//! Runs a single job attempt: optional start delay, pipeline blocking,
//! proxy user resolution, the job itself, then terminal bookkeeping.

use chrono::Utc;
use flowdeck_core::{
    ExecutableFlow, ExecutableNode, FlowStore, JobContext, JobTypeRegistry, Props, Status,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::flow_runner::FlowEvent;
use crate::logfile::{job_log_name, write_job_meta, FileLog};
use crate::watcher::{FlowWatcher, WatchTarget};

/// Job prop naming the user the work should run as.
pub const PROP_PROXY_USER: &str = "user.to.proxy";
/// Job prop turning a failure into FailedSucceeded.
pub const PROP_SUCCEED_ON_FAILURE: &str = "job.succeed.on.failure";

pub(crate) struct JobRunner {
    pub(crate) execution_id: i64,
    pub(crate) nested_id: String,
    flow: Arc<RwLock<ExecutableFlow>>,
    store: Arc<dyn FlowStore>,
    registry: Arc<JobTypeRegistry>,
    events: mpsc::UnboundedSender<FlowEvent>,
    working_dir: PathBuf,
    validate_proxy_user: bool,
    watcher: Option<Arc<dyn FlowWatcher>>,
    watch_targets: Vec<WatchTarget>,
    kill_token: CancellationToken,
    current_job: Mutex<Option<Arc<dyn flowdeck_core::Job>>>,
    killed: AtomicBool,
    killed_by_sla: AtomicBool,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        execution_id: i64,
        nested_id: String,
        flow: Arc<RwLock<ExecutableFlow>>,
        store: Arc<dyn FlowStore>,
        registry: Arc<JobTypeRegistry>,
        events: mpsc::UnboundedSender<FlowEvent>,
        working_dir: PathBuf,
        validate_proxy_user: bool,
        watcher: Option<Arc<dyn FlowWatcher>>,
        watch_targets: Vec<WatchTarget>,
    ) -> Self {
        Self {
            execution_id,
            nested_id,
            flow,
            store,
            registry,
            events,
            working_dir,
            validate_proxy_user,
            watcher,
            watch_targets,
            kill_token: CancellationToken::new(),
            current_job: Mutex::new(None),
            killed: AtomicBool::new(false),
            killed_by_sla: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Request cancellation. Unblocks delay and pipeline waits, then
    /// asks the job itself to stop.
    pub(crate) async fn kill(&self, by_sla: bool) {
        if by_sla {
            self.killed_by_sla.store(true, Ordering::SeqCst);
        }
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let now = Utc::now();
        {
            let mut flow = self.flow.write().await;
            if let Some(node) = flow.node_mut(&self.nested_id) {
                if node.status == Status::Running {
                    node.set_status(Status::Killing, now);
                }
            }
        }
        self.kill_token.cancel();
        let job = self
            .current_job
            .lock()
            .expect("current job lock poisoned")
            .clone();
        if let Some(job) = job {
            job.cancel();
        }
        tracing::info!(
            execution_id = self.execution_id,
            job = %self.nested_id,
            by_sla,
            "job kill requested"
        );
    }

    pub(crate) async fn run(&self) {
        let now = Utc::now();
        // Fast paths: nodes that never actually run still emit a
        // finished event so the traversal makes progress.
        let fast_path = {
            let mut flow = self.flow.write().await;
            match flow.node_mut(&self.nested_id) {
                None => Some(None),
                Some(node) if node.status.is_finished() => Some(None),
                Some(node) if node.status == Status::Disabled => {
                    node.skip(now);
                    Some(Some(node.clone()))
                }
                Some(node) if self.killed.load(Ordering::SeqCst) => {
                    if node.start_time.is_none() {
                        node.start_time = Some(now);
                    }
                    node.end_time = Some(now);
                    node.killed_by_sla = self.killed_by_sla.load(Ordering::SeqCst);
                    node.set_status(Status::Killed, now);
                    Some(Some(node.clone()))
                }
                Some(_) => None,
            }
        };
        if let Some(snapshot) = fast_path {
            if let Some(snapshot) = snapshot {
                self.persist_node(&snapshot).await;
            }
            self.finish();
            return;
        }

        let (attempt, delay_ms, job_type, input_props, submit_user, proxy_users) = {
            let flow = self.flow.read().await;
            let node = flow
                .node(&self.nested_id)
                .expect("dispatched node missing from arena");
            (
                node.attempt,
                node.delay_ms,
                node.job_type().unwrap_or_default().to_string(),
                node.input_props.clone(),
                flow.submit_user.clone(),
                flow.proxy_users.clone(),
            )
        };

        let log_path = self
            .working_dir
            .join(job_log_name(self.execution_id, &self.nested_id, attempt));
        let log = match FileLog::create(&log_path) {
            Ok(log) => Arc::new(log),
            Err(e) => {
                self.finish_with_failure(format!("could not open job log: {e:#}"), None)
                    .await;
                return;
            }
        };
        log.line(&format!(
            "Starting job {} attempt {} of execution {}",
            self.nested_id, attempt, self.execution_id
        ));

        if delay_ms > 0 && !self.is_killed() {
            log.line(&format!("Delaying start by {delay_ms}ms"));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = self.kill_token.cancelled() => {}
            }
        }

        if let Some(watcher) = &self.watcher {
            for target in &self.watch_targets {
                if self.is_killed() {
                    break;
                }
                log.line(&format!(
                    "Blocked on execution {} target {:?}",
                    watcher.execution_id(),
                    target
                ));
                let status = watcher.wait_finished(target, &self.kill_token).await;
                log.line(&format!("Unblocked, watched target finished as {status:?}"));
            }
        }

        if self.is_killed() {
            self.finish_terminal(Status::Killed, None, Some(&log)).await;
            return;
        }

        let effective_user = match resolve_proxy_user(
            &self.registry,
            &job_type,
            &input_props,
            &submit_user,
            &proxy_users,
            self.validate_proxy_user,
        ) {
            Ok(user) => user,
            Err(msg) => {
                log.line(&msg);
                self.finish_with_failure(msg, Some(&log)).await;
                return;
            }
        };
        log.line(&format!("Running as user '{effective_user}'"));

        let job = match self.registry.create(&job_type, &input_props) {
            Ok(job) => job,
            Err(e) => {
                let msg = format!("could not instantiate job: {e}");
                log.line(&msg);
                self.finish_with_failure(msg, Some(&log)).await;
                return;
            }
        };

        let now = Utc::now();
        let snapshot = {
            let mut flow = self.flow.write().await;
            flow.node_mut(&self.nested_id).map(|node| {
                node.start_time = Some(now);
                node.set_status(Status::Running, now);
                node.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            self.persist_node(&snapshot).await;
        }
        *self
            .current_job
            .lock()
            .expect("current job lock poisoned") = Some(job.clone());

        let ctx = JobContext {
            execution_id: self.execution_id,
            nested_id: self.nested_id.clone(),
            attempt,
            working_dir: self.working_dir.clone(),
            props: input_props.clone(),
            effective_user,
            log: log.clone(),
        };
        let outcome = tokio::select! {
            result = job.run(&ctx) => Some(result),
            _ = self.kill_token.cancelled() => {
                job.cancel();
                None
            }
        };
        *self
            .current_job
            .lock()
            .expect("current job lock poisoned") = None;

        let killed = self.is_killed();
        let succeed_on_failure = input_props.get_bool(PROP_SUCCEED_ON_FAILURE, false);
        match outcome {
            Some(Ok(output)) => {
                let status = if killed {
                    Status::Killed
                } else {
                    Status::Succeeded
                };
                self.finish_terminal(status, Some(output), Some(&log)).await;
            }
            Some(Err(e)) => {
                let msg = format!("{e:#}");
                log.line(&format!("Job failed: {msg}"));
                if killed {
                    self.finish_terminal(Status::Killed, None, Some(&log)).await;
                } else if succeed_on_failure {
                    log.line("Failure absorbed, job marked FAILED_SUCCEEDED");
                    self.finish_failure_with_status(Status::FailedSucceeded, msg, Some(&log))
                        .await;
                } else {
                    self.finish_failure_with_status(Status::Failed, msg, Some(&log))
                        .await;
                }
            }
            None => {
                log.line("Job killed before completion");
                self.finish_terminal(Status::Killed, None, Some(&log)).await;
            }
        }
    }

    async fn finish_with_failure(&self, message: String, log: Option<&Arc<FileLog>>) {
        self.finish_failure_with_status(Status::Failed, message, log)
            .await;
    }

    async fn finish_failure_with_status(
        &self,
        status: Status,
        message: String,
        log: Option<&Arc<FileLog>>,
    ) {
        let now = Utc::now();
        let snapshot = {
            let mut flow = self.flow.write().await;
            flow.node_mut(&self.nested_id).map(|node| {
                node.failure_message = Some(message.clone());
                if node.start_time.is_none() {
                    node.start_time = Some(now);
                }
                node.end_time = Some(now);
                node.killed_by_sla = self.killed_by_sla.load(Ordering::SeqCst);
                node.set_status(status, now);
                node.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            self.persist_node(&snapshot).await;
            self.write_meta(&snapshot);
        }
        self.upload_log(log).await;
        self.finish();
    }

    async fn finish_terminal(
        &self,
        status: Status,
        output: Option<Props>,
        log: Option<&Arc<FileLog>>,
    ) {
        let now = Utc::now();
        let snapshot = {
            let mut flow = self.flow.write().await;
            flow.node_mut(&self.nested_id).map(|node| {
                if let Some(output) = output {
                    node.output_props = output;
                }
                if node.start_time.is_none() {
                    node.start_time = Some(now);
                }
                node.end_time = Some(now);
                node.killed_by_sla = self.killed_by_sla.load(Ordering::SeqCst);
                node.set_status(status, now);
                node.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            if let Some(log) = log {
                log.line(&format!(
                    "Job {} finished with status {}",
                    self.nested_id, snapshot.status
                ));
            }
            self.persist_node(&snapshot).await;
            self.write_meta(&snapshot);
        }
        self.upload_log(log).await;
        self.finish();
    }

    fn write_meta(&self, node: &ExecutableNode) {
        if let Err(e) = write_job_meta(&self.working_dir, self.execution_id, node) {
            tracing::warn!(
                execution_id = self.execution_id,
                job = %node.nested_id,
                error = %e,
                "job metadata write failed"
            );
        }
    }

    async fn persist_node(&self, node: &ExecutableNode) {
        if let Err(e) = self.store.update_node(self.execution_id, node).await {
            tracing::warn!(
                execution_id = self.execution_id,
                job = %node.nested_id,
                error = %e,
                "node snapshot persistence failed"
            );
        }
    }

    async fn upload_log(&self, log: Option<&Arc<FileLog>>) {
        let Some(log) = log else { return };
        let attempt = {
            let flow = self.flow.read().await;
            flow.node(&self.nested_id).map(|n| n.attempt).unwrap_or(0)
        };
        match log.read_all() {
            Ok(data) => {
                if let Err(e) = self
                    .store
                    .upload_log(self.execution_id, &self.nested_id, attempt, data.into())
                    .await
                {
                    tracing::warn!(
                        execution_id = self.execution_id,
                        job = %self.nested_id,
                        error = %e,
                        "job log upload failed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = self.execution_id,
                    job = %self.nested_id,
                    error = %e,
                    "job log unreadable"
                );
            }
        }
    }

    fn finish(&self) {
        let _ = self
            .events
            .send(FlowEvent::JobFinished(self.nested_id.clone()));
    }
}

/// Decide which user the job runs as. A job-type default wins; an
/// explicit `user.to.proxy` prop is honored after validation; the
/// submitter is the fallback.
pub(crate) fn resolve_proxy_user(
    registry: &JobTypeRegistry,
    job_type: &str,
    props: &Props,
    submit_user: &str,
    proxy_users: &HashSet<String>,
    validate: bool,
) -> Result<String, String> {
    if let Some(user) = registry.default_proxy_user(job_type) {
        return Ok(user);
    }
    if let Some(user) = props.get(PROP_PROXY_USER) {
        if validate && !proxy_users.contains(user) {
            return Err(format!(
                "proxy user '{user}' is not allowed for this flow"
            ));
        }
        return Ok(user.to_string());
    }
    Ok(submit_user.to_string())
}
