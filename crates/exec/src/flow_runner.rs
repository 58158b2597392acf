//! Per-execution DAG traversal.
//!
//! One FlowRunner owns one execution: it dispatches ready jobs onto the
//! flow's private job pool, consumes completion events from a channel,
//! recomputes downstream candidates, and finalizes nested flows and the
//! root once their end nodes finish. Control operations (pause, resume,
//! kill, retry) flip shared flags and wake the loop through the same
//! channel.

use chrono::{DateTime, Utc};
use flowdeck_core::{
    check_condition_on_job_status, expr, Alerter, ConditionOnJobStatus, ConditionResult,
    ExecutableFlow, ExecutableNode, FailureAction, FlowStore, JobTypeRegistry, Props, Status,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::job_runner::JobRunner;
use crate::logfile::{flow_log_name, job_log_name, FileLog};
use crate::watcher::{FlowWatcher, WatchTarget};

pub const PROP_EXECUTION_ID: &str = "flowdeck.execution.id";
pub const PROP_FLOW_ID: &str = "flowdeck.flow.id";
pub const PROP_PROJECT_ID: &str = "flowdeck.project.id";
pub const PROP_PROJECT_VERSION: &str = "flowdeck.project.version";
pub const PROP_SUBMIT_USER: &str = "flowdeck.submit.user";
pub const PROP_WORKING_DIR: &str = "flowdeck.working.dir";
pub const PROP_JOB_ID: &str = "flowdeck.job.id";
pub const PROP_JOB_ATTEMPT: &str = "flowdeck.job.attempt";

#[derive(Debug)]
pub(crate) enum FlowEvent {
    JobFinished(String),
    Wake,
}

#[derive(Default)]
struct RunnerFlags {
    paused: AtomicBool,
    flow_failed: AtomicBool,
    killed: AtomicBool,
    finished: AtomicBool,
    retry_requested: AtomicBool,
}

/// State shared between the traversal loop, its handle, and the job
/// runners it spawns.
pub(crate) struct FlowShared {
    execution_id: i64,
    flow_id: String,
    execution_dir: PathBuf,
    flow: Arc<RwLock<ExecutableFlow>>,
    flags: RunnerFlags,
    events: mpsc::UnboundedSender<FlowEvent>,
    active_jobs: StdMutex<HashMap<String, Arc<JobRunner>>>,
    log: Arc<FileLog>,
    done: CancellationToken,
    failure_action: FailureAction,
    watcher: Option<Arc<dyn FlowWatcher>>,
    pause_time: StdMutex<Option<DateTime<Utc>>>,
}

impl FlowShared {
    /// Kill the execution. `mark_killing` distinguishes an operator
    /// kill (flow ends KILLED) from a cancel-all failure policy (flow
    /// keeps its FAILED_FINISHING trajectory).
    async fn kill_flow(&self, mark_killing: bool) {
        if self.flags.finished.load(Ordering::SeqCst) {
            return;
        }
        if self.flags.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flags.paused.store(false, Ordering::SeqCst);
        let now = Utc::now();
        {
            let mut flow = self.flow.write().await;
            if mark_killing {
                if !flow.status.is_finished() {
                    flow.status = Status::Killing;
                    flow.update_time = Some(now);
                }
                let running_subflows: Vec<String> = flow
                    .nodes()
                    .filter(|n| n.is_flow() && n.status == Status::Running)
                    .map(|n| n.nested_id.clone())
                    .collect();
                for id in running_subflows {
                    if let Some(node) = flow.node_mut(&id) {
                        node.set_status(Status::Killing, now);
                    }
                }
            } else if flow.status == Status::Paused {
                flow.status = Status::FailedFinishing;
                flow.update_time = Some(now);
            }
        }
        self.log.line("Cancelling active jobs");
        let runners: Vec<Arc<JobRunner>> = self
            .active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .values()
            .cloned()
            .collect();
        for runner in runners {
            runner.kill(false).await;
        }
        let _ = self.events.send(FlowEvent::Wake);
    }
}

/// Cheap cloneable view of a running execution. Control operations and
/// status queries go through this.
#[derive(Clone)]
pub struct FlowRunnerHandle {
    shared: Arc<FlowShared>,
}

impl FlowRunnerHandle {
    pub fn execution_id(&self) -> i64 {
        self.shared.execution_id
    }

    pub fn flow_id(&self) -> &str {
        &self.shared.flow_id
    }

    pub fn execution_dir(&self) -> &Path {
        &self.shared.execution_dir
    }

    pub fn is_finished(&self) -> bool {
        self.shared.flags.finished.load(Ordering::SeqCst)
    }

    pub async fn wait_finished(&self) {
        self.shared.done.cancelled().await;
    }

    pub async fn snapshot(&self) -> ExecutableFlow {
        self.shared.flow.read().await.clone()
    }

    pub async fn status(&self) -> Status {
        self.shared.flow.read().await.status
    }

    pub async fn start_time(&self) -> Option<DateTime<Utc>> {
        self.shared.flow.read().await.start_time
    }

    pub async fn node_status(&self, nested_id: &str) -> Option<Status> {
        self.shared
            .flow
            .read()
            .await
            .node(nested_id)
            .map(|n| n.status)
    }

    pub async fn node_start_time(&self, nested_id: &str) -> Option<DateTime<Utc>> {
        self.shared
            .flow
            .read()
            .await
            .node(nested_id)
            .and_then(|n| n.start_time)
    }

    pub fn flow_log_path(&self) -> PathBuf {
        self.shared.log.path().to_path_buf()
    }

    pub async fn job_log_path(&self, nested_id: &str, attempt: Option<u32>) -> Option<PathBuf> {
        let attempt = match attempt {
            Some(a) => a,
            None => {
                let flow = self.shared.flow.read().await;
                flow.node(nested_id)?.attempt
            }
        };
        Some(self.shared.execution_dir.join(job_log_name(
            self.shared.execution_id,
            nested_id,
            attempt,
        )))
    }

    pub async fn pause(&self, user: &str) {
        if self.shared.flags.finished.load(Ordering::SeqCst)
            || self.shared.flags.killed.load(Ordering::SeqCst)
        {
            return;
        }
        self.shared.log.line(&format!("Flow paused by {user}"));
        tracing::info!(execution_id = self.shared.execution_id, user, "flow paused");
        self.shared.flags.paused.store(true, Ordering::SeqCst);
        let now = Utc::now();
        *self
            .shared
            .pause_time
            .lock()
            .expect("pause time lock poisoned") = Some(now);
        {
            let mut flow = self.shared.flow.write().await;
            if flow.status == Status::Running {
                flow.status = Status::Paused;
                flow.update_time = Some(now);
            }
        }
        let _ = self.shared.events.send(FlowEvent::Wake);
    }

    pub async fn resume(&self, user: &str) {
        if !self.shared.flags.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let paused_at = self
            .shared
            .pause_time
            .lock()
            .expect("pause time lock poisoned")
            .take();
        let paused_for = paused_at
            .map(|t| (Utc::now() - t).num_seconds())
            .unwrap_or(0);
        self.shared
            .log
            .line(&format!("Flow resumed by {user} after {paused_for}s paused"));
        let now = Utc::now();
        {
            let mut flow = self.shared.flow.write().await;
            if flow.status == Status::Paused {
                // Restore the semantic status the pause was hiding.
                flow.status = if self.shared.flags.killed.load(Ordering::SeqCst) {
                    Status::Killing
                } else if self.shared.flags.flow_failed.load(Ordering::SeqCst) {
                    Status::FailedFinishing
                } else {
                    Status::Running
                };
                flow.update_time = Some(now);
            }
        }
        let _ = self.shared.events.send(FlowEvent::Wake);
    }

    pub async fn kill(&self, user: &str) {
        self.shared.log.line(&format!("Flow kill requested by {user}"));
        tracing::info!(execution_id = self.shared.execution_id, user, "flow kill");
        self.shared.kill_flow(true).await;
    }

    pub async fn retry_failures(&self, user: &str) {
        if self.shared.flags.finished.load(Ordering::SeqCst) {
            return;
        }
        self.shared
            .log
            .line(&format!("Retry of failed jobs requested by {user}"));
        self.shared.flags.retry_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.events.send(FlowEvent::Wake);
    }

    /// Kill one running job. Returns false if the job is not active.
    pub async fn kill_job(&self, nested_id: &str, by_sla: bool) -> bool {
        let runner = self
            .shared
            .active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .get(nested_id)
            .cloned();
        match runner {
            Some(runner) => {
                runner.kill(by_sla).await;
                true
            }
            None => false,
        }
    }
}

pub struct FlowRunnerSettings {
    pub num_job_threads: usize,
    /// Self-heal wakeup when no events arrive.
    pub check_interval: Duration,
    pub validate_proxy_user: bool,
    pub watcher: Option<Arc<dyn FlowWatcher>>,
    pub pipeline_level: u8,
}

impl Default for FlowRunnerSettings {
    fn default() -> Self {
        Self {
            num_job_threads: 10,
            check_interval: Duration::from_secs(300),
            validate_proxy_user: false,
            watcher: None,
            pipeline_level: 1,
        }
    }
}

pub struct FlowRunner {
    shared: Arc<FlowShared>,
    events: mpsc::UnboundedReceiver<FlowEvent>,
    store: Arc<dyn FlowStore>,
    registry: Arc<JobTypeRegistry>,
    alerter: Arc<dyn Alerter>,
    check_interval: Duration,
    validate_proxy_user: bool,
    pipeline_level: u8,
    job_sem: Arc<Semaphore>,
    job_tasks: JoinSet<()>,
    pending_finished: VecDeque<String>,
}

impl FlowRunner {
    pub fn new(
        mut flow: ExecutableFlow,
        execution_dir: PathBuf,
        store: Arc<dyn FlowStore>,
        registry: Arc<JobTypeRegistry>,
        alerter: Arc<dyn Alerter>,
        settings: FlowRunnerSettings,
    ) -> anyhow::Result<(FlowRunner, FlowRunnerHandle)> {
        std::fs::create_dir_all(&execution_dir)?;
        let log = Arc::new(FileLog::create(
            execution_dir.join(flow_log_name(flow.execution_id, &flow.flow_id)),
        )?);
        let (tx, rx) = mpsc::unbounded_channel();
        let failure_action = flow.options.failure_action;
        flow.execution_path = Some(execution_dir.clone());
        let shared = Arc::new(FlowShared {
            execution_id: flow.execution_id,
            flow_id: flow.flow_id.clone(),
            execution_dir,
            flow: Arc::new(RwLock::new(flow)),
            flags: RunnerFlags::default(),
            events: tx,
            active_jobs: StdMutex::new(HashMap::new()),
            log,
            done: CancellationToken::new(),
            failure_action,
            watcher: settings.watcher,
            pause_time: StdMutex::new(None),
        });
        let runner = FlowRunner {
            shared: shared.clone(),
            events: rx,
            store,
            registry,
            alerter,
            check_interval: settings.check_interval,
            validate_proxy_user: settings.validate_proxy_user,
            pipeline_level: settings.pipeline_level,
            job_sem: Arc::new(Semaphore::new(settings.num_job_threads.max(1))),
            job_tasks: JoinSet::new(),
            pending_finished: VecDeque::new(),
        };
        Ok((runner, FlowRunnerHandle { shared }))
    }

    pub fn handle(&self) -> FlowRunnerHandle {
        FlowRunnerHandle {
            shared: self.shared.clone(),
        }
    }

    pub async fn run(mut self) {
        let execution_id = self.shared.execution_id;
        if let Err(e) = self.execute().await {
            tracing::error!(execution_id, error = %format!("{e:#}"), "flow execution aborted");
            self.shared.log.line(&format!("Execution aborted: {e:#}"));
            let now = Utc::now();
            let mut flow = self.shared.flow.write().await;
            if !flow.status.is_finished() {
                flow.status = Status::Failed;
                flow.update_time = Some(now);
            }
            drop(flow);
            self.shared.flags.finished.store(true, Ordering::SeqCst);
        }
        self.wrap_up().await;
    }

    async fn execute(&mut self) -> anyhow::Result<()> {
        let now = Utc::now();
        let starts = {
            let mut flow = self.shared.flow.write().await;
            flow.start_time = Some(now);
            flow.status = Status::Running;
            flow.update_time = Some(now);
            // submit-time parameters override the flow's own inputs,
            // system props override both
            let params = flow.options.flow_parameters.clone();
            flow.input_props.extend_from(&params);
            let common = common_props(&flow, &self.shared.execution_dir);
            flow.input_props.extend_from(&common);
            flow.start_nodes_of(None)
        };
        self.persist_flow().await;
        tracing::info!(
            execution_id = self.shared.execution_id,
            flow_id = %self.shared.flow_id,
            "starting flow execution"
        );
        self.shared.log.line(&format!(
            "Starting execution {} of flow {}",
            self.shared.execution_id, self.shared.flow_id
        ));

        for id in starts {
            self.run_ready_node(&id).await?;
        }
        self.progress().await?;

        while !self.shared.flags.finished.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.check_interval, self.events.recv()).await {
                Ok(Some(event)) => self.absorb(event).await,
                Ok(None) => break,
                Err(_) => self.shared.log.line("No activity, running self check"),
            }
            while let Ok(event) = self.events.try_recv() {
                self.absorb(event).await;
            }
            if self.shared.flags.retry_requested.swap(false, Ordering::SeqCst) {
                self.retry_all_failures().await?;
            }
            if self.shared.flags.paused.load(Ordering::SeqCst) {
                continue;
            }
            self.progress().await?;
        }

        while self.job_tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn absorb(&mut self, event: FlowEvent) {
        match event {
            FlowEvent::Wake => {}
            FlowEvent::JobFinished(id) => {
                self.shared
                    .active_jobs
                    .lock()
                    .expect("active jobs lock poisoned")
                    .remove(&id);
                // A failure under cancel-all must not stay parked behind
                // a pause; unpause so the kill can proceed.
                if self.shared.flags.paused.load(Ordering::SeqCst)
                    && self.shared.failure_action == FailureAction::CancelAll
                {
                    let failed = {
                        let flow = self.shared.flow.read().await;
                        flow.node(&id).map(|n| n.status == Status::Failed) == Some(true)
                    };
                    if failed {
                        self.shared.flags.paused.store(false, Ordering::SeqCst);
                        let mut flow = self.shared.flow.write().await;
                        if flow.status == Status::Paused {
                            flow.status = Status::Running;
                        }
                        self.shared
                            .log
                            .line("Job failed under cancel-all policy, resuming to cancel");
                    }
                }
                self.pending_finished.push_back(id);
            }
        }
    }

    /// Drain finished nodes, retry or propagate failures, finalize
    /// completed scopes, and dispatch downstream candidates.
    async fn progress(&mut self) -> anyhow::Result<()> {
        let mut touched = false;
        while let Some(id) = self.pending_finished.pop_front() {
            touched = true;
            let info = {
                let flow = self.shared.flow.read().await;
                flow.node(&id)
                    .map(|n| (n.status, n.killed_by_sla, n.out_nodes.clone(), n.parent.clone()))
            };
            let Some((status, killed_by_sla, out_nodes, parent)) = info else {
                continue;
            };
            self.shared
                .log
                .line(&format!("Node {id} finished with status {status}"));

            if status == Status::Failed || (status == Status::Killed && killed_by_sla) {
                if self.retry_node_if_possible(&id).await {
                    self.run_ready_node(&id).await?;
                    continue;
                }
                self.set_flow_failed(&id).await;
            }

            if out_nodes.is_empty() {
                match &parent {
                    None => {
                        if self.scope_finished(None).await {
                            self.finalize_scope(None).await;
                        }
                    }
                    Some(p) => {
                        if self.scope_finished(Some(p.as_str())).await {
                            self.finalize_scope(Some(p.as_str())).await;
                            self.pending_finished.push_back(p.clone());
                        }
                    }
                }
            }
            for out in out_nodes {
                self.run_ready_node(&out).await?;
            }
        }
        if touched {
            self.persist_flow().await;
        }
        Ok(())
    }

    /// Evaluate a node and act on its implied status: skip, cancel, or
    /// start it. Recurses into embedded flows.
    fn run_ready_node<'a>(
        &'a mut self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let now = Utc::now();
            let implied = {
                let flow = self.shared.flow.read().await;
                implied_status(&flow, id, &self.shared.flags, self.shared.failure_action)
            };
            let Some(implied) = implied else {
                return Ok(());
            };
            match implied {
                Status::Skipped => {
                    let snapshot = {
                        let mut flow = self.shared.flow.write().await;
                        flow.node_mut(id).map(|n| {
                            n.skip(now);
                            n.clone()
                        })
                    };
                    if let Some(snapshot) = snapshot {
                        self.shared.log.line(&format!("Node {id} is disabled, skipping"));
                        self.persist_node(&snapshot).await;
                        self.pending_finished.push_back(id.to_string());
                    }
                }
                Status::Cancelled => {
                    let snapshot = {
                        let mut flow = self.shared.flow.write().await;
                        flow.node_mut(id).map(|n| {
                            n.cancel(now);
                            n.clone()
                        })
                    };
                    if let Some(snapshot) = snapshot {
                        self.shared.log.line(&format!("Node {id} cancelled"));
                        self.persist_node(&snapshot).await;
                        self.pending_finished.push_back(id.to_string());
                    }
                }
                _ => {
                    let is_flow = {
                        let flow = self.shared.flow.read().await;
                        flow.node(id).map(|n| n.is_flow()) == Some(true)
                    };
                    if is_flow {
                        let children = {
                            let mut flow = self.shared.flow.write().await;
                            let parent = flow.node(id).and_then(|n| n.parent.clone());
                            let scope_input = flow.scope_input_props(parent.as_deref());
                            if let Some(node) = flow.node_mut(id) {
                                let mut input = scope_input;
                                input.extend_from(&node.override_props);
                                node.input_props = input;
                                node.start_time = Some(now);
                                node.set_status(Status::Running, now);
                            }
                            flow.start_nodes_of(Some(id))
                        };
                        self.shared.log.line(&format!("Starting subflow {id}"));
                        for child in children {
                            self.run_ready_node(&child).await?;
                        }
                    } else {
                        self.dispatch_job(id, now).await;
                    }
                }
            }
            Ok(())
        })
    }

    /// Resolve layered input props, mark the node queued, and hand it to
    /// the job pool.
    async fn dispatch_job(&mut self, id: &str, now: DateTime<Utc>) {
        let prepared = {
            let mut flow = self.shared.flow.write().await;
            let parent = flow.node(id).and_then(|n| n.parent.clone());
            let scope_input = flow.scope_input_props(parent.as_deref());
            let upstream_outputs: Vec<Props> = flow
                .node(id)
                .map(|n| {
                    n.in_nodes
                        .iter()
                        .filter_map(|i| flow.node(i).map(|u| u.output_props.clone()))
                        .collect()
                })
                .unwrap_or_default();
            let snapshot = flow.node_mut(id).map(|node| {
                let mut layers: Vec<&Props> = vec![&scope_input];
                layers.extend(upstream_outputs.iter());
                layers.push(&node.override_props);
                let mut input = Props::layered(layers);
                input.put(PROP_JOB_ID, node.nested_id.clone());
                input.put(PROP_JOB_ATTEMPT, node.attempt.to_string());
                node.input_props = input;
                node.set_status(Status::Queued, now);
                node.clone()
            });
            snapshot.map(|snapshot| {
                let targets = if self.shared.watcher.is_some() {
                    pipeline_watch_targets(&flow, &snapshot, self.pipeline_level)
                } else {
                    Vec::new()
                };
                (snapshot, targets)
            })
        };
        let Some((snapshot, watch_targets)) = prepared else {
            return;
        };
        self.persist_node(&snapshot).await;
        self.shared.log.line(&format!(
            "Dispatching job {id} (attempt {})",
            snapshot.attempt
        ));

        let runner = Arc::new(JobRunner::new(
            self.shared.execution_id,
            id.to_string(),
            self.shared.flow.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.shared.events.clone(),
            self.shared.execution_dir.clone(),
            self.validate_proxy_user,
            self.shared.watcher.clone(),
            watch_targets,
        ));
        self.shared
            .active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .insert(id.to_string(), runner.clone());
        let sem = self.job_sem.clone();
        self.job_tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("job semaphore closed");
            runner.run().await;
        });
    }

    async fn retry_node_if_possible(&mut self, id: &str) -> bool {
        if self.shared.flags.killed.load(Ordering::SeqCst) {
            return false;
        }
        let now = Utc::now();
        let snapshot = {
            let mut flow = self.shared.flow.write().await;
            flow.node_mut(id).and_then(|node| {
                if node.can_retry() {
                    node.reset_for_retry(now);
                    Some(node.clone())
                } else {
                    None
                }
            })
        };
        match snapshot {
            Some(node) => {
                self.shared.log.line(&format!(
                    "Retrying node {id}, attempt {} of {}",
                    node.attempt, node.retries
                ));
                self.persist_node(&node).await;
                true
            }
            None => false,
        }
    }

    /// A node failed for good. Decide whether the failure reaches the
    /// flow: it does when the node has no out-edges, or when every
    /// downstream join is ALL_SUCCESS. Other joins absorb it.
    async fn set_flow_failed(&mut self, id: &str) {
        let now = Utc::now();
        let should_fail = {
            let mut flow = self.shared.flow.write().await;
            let Some((node_status, out_nodes, parent)) = flow
                .node(id)
                .map(|n| (n.status, n.out_nodes.clone(), n.parent.clone()))
            else {
                return;
            };
            let should_fail = out_nodes.is_empty()
                || out_nodes.iter().all(|o| {
                    flow.node(o)
                        .map(|n| n.condition_on_job_status == ConditionOnJobStatus::AllSuccess)
                        .unwrap_or(true)
                });
            if should_fail {
                let propagated = if node_status == Status::Killed {
                    Status::Killing
                } else {
                    Status::FailedFinishing
                };
                let mut scope = parent;
                loop {
                    let current = flow.status_of(scope.as_deref());
                    if !current.is_finished() && current != Status::Killing {
                        flow.set_status_of(scope.as_deref(), propagated, now);
                    }
                    match scope {
                        Some(s) => scope = flow.node(&s).and_then(|n| n.parent.clone()),
                        None => break,
                    }
                }
            }
            should_fail
        };
        if !should_fail {
            self.shared
                .log
                .line(&format!("Failure of {id} absorbed by downstream joins"));
            return;
        }
        self.shared.log.line(&format!("Node {id} failed the flow"));
        let first = !self.shared.flags.flow_failed.swap(true, Ordering::SeqCst);
        if first {
            let snapshot = self.shared.flow.read().await.clone();
            self.alerter.alert_first_error(&snapshot).await;
        }
        if self.shared.failure_action == FailureAction::CancelAll
            && !self.shared.flags.killed.load(Ordering::SeqCst)
        {
            self.shared.log.line("Failure action is cancel-all, killing flow");
            self.shared.kill_flow(false).await;
        }
    }

    async fn scope_finished(&self, scope: Option<&str>) -> bool {
        let flow = self.shared.flow.read().await;
        flow.end_nodes_of(scope)
            .iter()
            .all(|e| flow.node(e).map(|n| n.status.is_finished()) == Some(true))
    }

    /// All end nodes of a scope are finished: settle its final status
    /// and chain end-node outputs into the scope output.
    async fn finalize_scope(&mut self, scope: Option<&str>) {
        let now = Utc::now();
        let final_status = {
            let mut flow = self.shared.flow.write().await;
            let ends = flow.end_nodes_of(scope);
            let children = flow.children_of(scope);
            let ends_clean = ends.iter().all(|e| {
                flow.node(e)
                    .map(|n| !n.status.is_failure() && n.status != Status::Killing)
                    .unwrap_or(true)
            });
            let any_child_failed = children
                .iter()
                .any(|c| flow.node(c).map(|n| n.status == Status::Failed) == Some(true));
            let succeeded = ends_clean && !any_child_failed;

            let outputs: Vec<Props> = ends
                .iter()
                .filter_map(|e| flow.node(e).map(|n| n.output_props.clone()))
                .collect();

            let mut status = flow.status_of(scope);
            if !succeeded && status == Status::Running {
                status = Status::FailedFinishing;
            }
            let final_status = match status {
                Status::FailedFinishing => Status::Failed,
                Status::Killing => Status::Killed,
                s if s.is_finished() => s,
                _ => Status::Succeeded,
            };
            flow.set_status_of(scope, final_status, now);
            for output in &outputs {
                flow.merge_output_of(scope, output);
            }
            flow.stamp_scope_end(scope, now);
            final_status
        };
        match scope {
            None => {
                self.shared
                    .log
                    .line(&format!("Flow finished with status {final_status}"));
                self.shared.flags.finished.store(true, Ordering::SeqCst);
            }
            Some(id) => {
                self.shared
                    .log
                    .line(&format!("Subflow {id} finished with status {final_status}"));
            }
        }
    }

    /// Reset failed, killed and cancelled nodes back to runnable and
    /// re-enter traversal. A flow with no such nodes is untouched.
    async fn retry_all_failures(&mut self) -> anyhow::Result<()> {
        self.shared.log.line("Resetting failed state for retry");
        self.shared.flags.killed.store(false, Ordering::SeqCst);
        self.shared.flags.flow_failed.store(false, Ordering::SeqCst);
        let now = Utc::now();
        let candidates = {
            let mut flow = self.shared.flow.write().await;
            if matches!(flow.status, Status::FailedFinishing | Status::Killing) {
                flow.status = Status::Running;
                flow.end_time = None;
                flow.update_time = Some(now);
            }
            let ids: Vec<String> = flow.node_ids().map(str::to_string).collect();
            for id in &ids {
                let is_flow_kind = flow.node(id).map(|n| n.is_flow()) == Some(true);
                if let Some(node) = flow.node_mut(id) {
                    match node.status {
                        Status::Failed | Status::Killed => {
                            if is_flow_kind {
                                node.end_time = None;
                                if node.start_time.is_some() {
                                    node.set_status(Status::Running, now);
                                } else {
                                    node.set_status(Status::Ready, now);
                                }
                            } else {
                                node.reset_for_retry(now);
                            }
                        }
                        // Cancelled nodes never ran; restore them without
                        // consuming a retry attempt.
                        Status::Cancelled => {
                            if is_flow_kind {
                                node.end_time = None;
                                if node.start_time.is_some() {
                                    node.set_status(Status::Running, now);
                                } else {
                                    node.set_status(Status::Ready, now);
                                }
                            } else {
                                node.start_time = None;
                                node.end_time = None;
                                node.failure_message = None;
                                node.set_status(Status::Ready, now);
                            }
                        }
                        Status::FailedFinishing | Status::Killing => {
                            node.end_time = None;
                            node.set_status(Status::Running, now);
                        }
                        _ => {}
                    }
                }
            }
            // Skipped nodes on a still-running path go back to disabled so
            // the traversal skips them afresh.
            let mut reskip = Vec::new();
            for id in &ids {
                if flow.node(id).map(|n| n.status == Status::Skipped) == Some(true)
                    && scope_chain_running(&flow, id)
                {
                    reskip.push(id.clone());
                }
            }
            for id in &reskip {
                if let Some(node) = flow.node_mut(id) {
                    node.start_time = None;
                    node.end_time = None;
                    node.set_status(Status::Disabled, now);
                }
            }
            let mut candidates = Vec::new();
            for id in &ids {
                let runnable = flow
                    .node(id)
                    .map(|n| matches!(n.status, Status::Ready | Status::Disabled))
                    == Some(true);
                if runnable && scope_chain_running(&flow, id) {
                    candidates.push(id.clone());
                }
            }
            candidates
        };
        self.persist_flow().await;
        for id in candidates {
            self.run_ready_node(&id).await?;
        }
        Ok(())
    }

    async fn wrap_up(&mut self) {
        if let Some(watcher) = &self.shared.watcher {
            watcher.stop();
        }
        let now = Utc::now();
        let snapshot = {
            let mut flow = self.shared.flow.write().await;
            if flow.end_time.is_none() {
                flow.end_time = Some(now);
                flow.update_time = Some(now);
            }
            flow.clone()
        };
        if let Err(e) = self.store.update_flow(&snapshot).await {
            tracing::warn!(
                execution_id = snapshot.execution_id,
                error = %e,
                "final flow snapshot persistence failed"
            );
        }
        self.alerter.alert_flow_finished(&snapshot).await;
        self.shared.log.line(&format!(
            "Execution {} done with status {}",
            snapshot.execution_id, snapshot.status
        ));
        match self.shared.log.read_all() {
            Ok(data) => {
                if let Err(e) = self
                    .store
                    .upload_log(snapshot.execution_id, &snapshot.flow_id, 0, data.into())
                    .await
                {
                    tracing::warn!(
                        execution_id = snapshot.execution_id,
                        error = %e,
                        "flow log upload failed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = snapshot.execution_id,
                    error = %e,
                    "flow log unreadable"
                );
            }
        }
        tracing::info!(
            execution_id = snapshot.execution_id,
            status = %snapshot.status,
            "flow execution finished"
        );
        self.shared.flags.finished.store(true, Ordering::SeqCst);
        self.shared.done.cancel();
    }

    async fn persist_flow(&self) {
        let snapshot = self.shared.flow.read().await.clone();
        if let Err(e) = self.store.update_flow(&snapshot).await {
            tracing::warn!(
                execution_id = snapshot.execution_id,
                error = %e,
                "flow snapshot persistence failed"
            );
        }
    }

    async fn persist_node(&self, node: &ExecutableNode) {
        if let Err(e) = self
            .store
            .update_node(self.shared.execution_id, node)
            .await
        {
            tracing::warn!(
                execution_id = self.shared.execution_id,
                node = %node.nested_id,
                error = %e,
                "node snapshot persistence failed"
            );
        }
    }
}

fn common_props(flow: &ExecutableFlow, execution_dir: &Path) -> Props {
    Props::new()
        .with(PROP_EXECUTION_ID, flow.execution_id.to_string())
        .with(PROP_FLOW_ID, flow.flow_id.clone())
        .with(PROP_PROJECT_ID, flow.project_id.to_string())
        .with(PROP_PROJECT_VERSION, flow.version.to_string())
        .with(PROP_SUBMIT_USER, flow.submit_user.clone())
        .with(PROP_WORKING_DIR, execution_dir.display().to_string())
}

/// The next status a waiting node should take, or None to keep waiting.
fn implied_status(
    flow: &ExecutableFlow,
    id: &str,
    flags: &RunnerFlags,
    failure_action: FailureAction,
) -> Option<Status> {
    let node = flow.node(id)?;
    if node.status.not_ready_to_run() {
        return None;
    }
    let upstream: Vec<Status> = node
        .in_nodes
        .iter()
        .filter_map(|i| flow.node(i).map(|n| n.status))
        .collect();
    let join = check_condition_on_job_status(node.condition_on_job_status, &upstream);
    if join == ConditionResult::Pending {
        return None;
    }
    if node.status == Status::Disabled {
        return Some(Status::Skipped);
    }
    if flags.killed.load(Ordering::SeqCst)
        || (flags.flow_failed.load(Ordering::SeqCst)
            && failure_action == FailureAction::FinishCurrentlyRunning)
    {
        return Some(Status::Cancelled);
    }
    if join == ConditionResult::Failed {
        return Some(Status::Cancelled);
    }
    if !runtime_condition_met(flow, node) {
        return Some(Status::Cancelled);
    }
    Some(Status::Ready)
}

fn runtime_condition_met(flow: &ExecutableFlow, node: &ExecutableNode) -> bool {
    let Some(condition) = &node.condition else {
        return true;
    };
    let result = expr::evaluate(condition, &|job, prop| {
        let sibling = flow.sibling_nested_id(&node.nested_id, job);
        flow.node(&sibling).and_then(|n| {
            n.output_props
                .get(prop)
                .or_else(|| n.input_props.get(prop))
                .map(str::to_string)
        })
    });
    match result {
        Ok(met) => met,
        Err(e) => {
            tracing::warn!(
                node = %node.nested_id,
                condition,
                error = %e,
                "condition evaluation failed, treating as unmet"
            );
            false
        }
    }
}

fn scope_chain_running(flow: &ExecutableFlow, id: &str) -> bool {
    let mut scope = flow.node(id).and_then(|n| n.parent.clone());
    while let Some(s) = scope {
        match flow.node(&s) {
            Some(n) if n.status == Status::Running => scope = n.parent.clone(),
            _ => return false,
        }
    }
    true
}

/// Targets a pipelined job waits on in the watched execution.
fn pipeline_watch_targets(
    flow: &ExecutableFlow,
    node: &ExecutableNode,
    level: u8,
) -> Vec<WatchTarget> {
    let mut targets = vec![WatchTarget::Node(node.nested_id.clone())];
    match level {
        0 | 1 => {}
        2 => {
            for id in downstream_frontier(flow, node) {
                targets.push(WatchTarget::Node(id));
            }
        }
        _ => targets.push(WatchTarget::Flow),
    }
    targets
}

/// Immediate downstream leaf frontier of a node, climbing out of
/// finished scopes and descending into subflow start sets.
fn downstream_frontier(flow: &ExecutableFlow, node: &ExecutableNode) -> Vec<String> {
    let mut outs = node.out_nodes.clone();
    let mut cursor = node.nested_id.clone();
    while outs.is_empty() {
        match flow.node(&cursor).and_then(|n| n.parent.clone()) {
            Some(parent) => {
                outs = flow
                    .node(&parent)
                    .map(|n| n.out_nodes.clone())
                    .unwrap_or_default();
                cursor = parent;
            }
            None => break,
        }
    }
    let mut frontier = Vec::new();
    let mut stack = outs;
    while let Some(id) = stack.pop() {
        match flow.node(&id) {
            Some(n) if n.is_flow() => stack.extend(flow.start_nodes_of(Some(&id))),
            Some(_) => frontier.push(id),
            None => {}
        }
    }
    frontier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::LocalFlowWatcher;
    use async_trait::async_trait;
    use flowdeck_core::{
        ExecutionOptions, FlowBuilder, Job, JobContext, MemoryFlowStore, NodeSpec,
    };
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct TestJob {
        fail: bool,
        fail_below_attempt: u32,
        sleep_ms: u64,
        output: Vec<(String, String)>,
        cancelled: Notify,
    }

    #[async_trait]
    impl Job for TestJob {
        async fn run(&self, ctx: &JobContext) -> anyhow::Result<Props> {
            if self.sleep_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.sleep_ms)) => {}
                    _ = self.cancelled.notified() => anyhow::bail!("cancelled"),
                }
            }
            if self.fail || ctx.attempt < self.fail_below_attempt {
                anyhow::bail!("intentional failure");
            }
            let mut out = Props::new();
            for (k, v) in &self.output {
                out.put(k.clone(), v.clone());
            }
            Ok(out)
        }

        fn cancel(&self) {
            self.cancelled.notify_waiters();
        }
    }

    fn test_registry() -> Arc<JobTypeRegistry> {
        let registry = JobTypeRegistry::new();
        registry.register("test", |props| {
            let output = props
                .get("test.output")
                .map(|s| {
                    s.split(',')
                        .filter_map(|pair| pair.split_once('='))
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Arc::new(TestJob {
                fail: props.get_bool("test.fail", false),
                fail_below_attempt: props.get_u64("test.fail.below.attempt", 0) as u32,
                sleep_ms: props.get_u64("test.sleep.ms", 0),
                output,
                cancelled: Notify::new(),
            }) as Arc<dyn Job>)
        });
        Arc::new(registry)
    }

    #[derive(Default)]
    struct RecordingAlerter {
        first_errors: AtomicUsize,
        finished: AtomicUsize,
        sla: AtomicUsize,
    }

    #[async_trait]
    impl Alerter for RecordingAlerter {
        async fn alert_first_error(&self, _flow: &ExecutableFlow) {
            self.first_errors.fetch_add(1, Ordering::SeqCst);
        }
        async fn alert_flow_finished(&self, _flow: &ExecutableFlow) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        async fn alert_sla(&self, _option: &flowdeck_core::SlaOption, _message: &str) {
            self.sla.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        store: Arc<MemoryFlowStore>,
        registry: Arc<JobTypeRegistry>,
        alerter: Arc<RecordingAlerter>,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
            Self {
                store: Arc::new(MemoryFlowStore::new()),
                registry: test_registry(),
                alerter: Arc::new(RecordingAlerter::default()),
                dir: TempDir::new().unwrap(),
            }
        }

        fn launch_with(
            &self,
            flow: ExecutableFlow,
            settings: FlowRunnerSettings,
        ) -> (FlowRunnerHandle, tokio::task::JoinHandle<()>) {
            let execution_dir = self.dir.path().join(flow.execution_id.to_string());
            self.store.insert_flow(flow.clone());
            let (runner, handle) = FlowRunner::new(
                flow,
                execution_dir,
                self.store.clone(),
                self.registry.clone(),
                self.alerter.clone(),
                settings,
            )
            .unwrap();
            let task = tokio::spawn(runner.run());
            (handle, task)
        }

        fn launch(&self, flow: ExecutableFlow) -> (FlowRunnerHandle, tokio::task::JoinHandle<()>) {
            self.launch_with(flow, FlowRunnerSettings::default())
        }

        async fn run_to_end(&self, flow: ExecutableFlow) -> ExecutableFlow {
            let (handle, task) = self.launch(flow);
            tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
                .await
                .expect("flow did not finish in time");
            task.await.unwrap();
            handle.snapshot().await
        }
    }

    fn job(id: &str) -> NodeSpec {
        NodeSpec::job(id, "test")
    }

    fn failing(id: &str) -> NodeSpec {
        NodeSpec::job(id, "test").props(Props::new().with("test.fail", "true"))
    }

    fn sleeping(id: &str, ms: u64) -> NodeSpec {
        NodeSpec::job(id, "test").props(Props::new().with("test.sleep.ms", ms.to_string()))
    }

    fn diamond(d: NodeSpec) -> ExecutableFlow {
        FlowBuilder::new("diamond")
            .node(job("a"))
            .node(job("b").depends_on(["a"]))
            .node(failing("c").depends_on(["a"]))
            .node(d.depends_on(["b", "c"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn linear_flow_succeeds_and_chains_outputs() {
        let h = Harness::new();
        let flow = FlowBuilder::new("linear")
            .node(job("a").props(Props::new().with("test.output", "stage=a")))
            .node(
                job("b")
                    .depends_on(["a"])
                    .props(Props::new().with("test.output", "stage=b,rows=10")),
            )
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.status, Status::Succeeded);
        let a = result.node("a").unwrap();
        let b = result.node("b").unwrap();
        assert_eq!(a.status, Status::Succeeded);
        assert_eq!(b.status, Status::Succeeded);
        // dependency order: b starts only after a is finished
        assert!(b.start_time.unwrap() >= a.end_time.unwrap());
        // end node output chained into flow output
        assert_eq!(result.output_props.get("stage"), Some("b"));
        assert_eq!(result.output_props.get("rows"), Some("10"));
        // upstream output flowed into downstream input
        assert_eq!(b.input_props.get("stage"), Some("a"));
        assert_eq!(h.alerter.finished.load(Ordering::SeqCst), 1);
        assert_eq!(h.alerter.first_errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flow_parameters_override_input_props() {
        let h = Harness::new();
        let options = ExecutionOptions {
            flow_parameters: Props::new().with("env", "prod"),
            ..Default::default()
        };
        let flow = FlowBuilder::new("params")
            .input_props(Props::new().with("env", "dev").with("region", "us-east"))
            .node(job("a"))
            .build(1, "alice", options)
            .unwrap();
        let result = h.run_to_end(flow).await;

        let a = result.node("a").unwrap();
        assert_eq!(a.input_props.get("env"), Some("prod"));
        assert_eq!(a.input_props.get("region"), Some("us-east"));
        assert_eq!(a.input_props.get(PROP_EXECUTION_ID), Some("1"));
    }

    #[tokio::test]
    async fn all_success_join_cancels_downstream_on_failure() {
        let h = Harness::new();
        let result = h.run_to_end(diamond(job("d"))).await;

        assert_eq!(result.node("a").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("b").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("c").unwrap().status, Status::Failed);
        assert_eq!(result.node("d").unwrap().status, Status::Cancelled);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(h.alerter.first_errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_done_join_runs_downstream_but_flow_still_fails() {
        let h = Harness::new();
        let result = h
            .run_to_end(diamond(job("d").condition_on(ConditionOnJobStatus::AllDone)))
            .await;

        assert_eq!(result.node("c").unwrap().status, Status::Failed);
        assert_eq!(result.node("d").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn failed_node_with_no_downstream_fails_flow() {
        let h = Harness::new();
        let flow = FlowBuilder::new("dangling")
            .node(job("a"))
            .node(failing("b"))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;
        assert_eq!(result.node("a").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("b").unwrap().status, Status::Failed);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn one_failed_branch_absorbs_failure_and_runs() {
        let h = Harness::new();
        let flow = FlowBuilder::new("recovery")
            .node(failing("a"))
            .node(
                job("cleanup")
                    .depends_on(["a"])
                    .condition_on(ConditionOnJobStatus::OneFailed),
            )
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        // The recovery branch runs despite the upstream failure.
        assert_eq!(result.node("cleanup").unwrap().status, Status::Succeeded);
        // The failed node still decides the flow outcome.
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn succeed_on_failure_counts_as_success() {
        let h = Harness::new();
        let flow = FlowBuilder::new("best_effort")
            .node(failing("a").props(
                Props::new()
                    .with("test.fail", "true")
                    .with(crate::job_runner::PROP_SUCCEED_ON_FAILURE, "true"),
            ))
            .node(job("b").depends_on(["a"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("a").unwrap().status, Status::FailedSucceeded);
        assert_eq!(result.node("b").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(h.alerter.first_errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_budget_consumed_then_succeeds() {
        let h = Harness::new();
        let flow = FlowBuilder::new("flaky")
            .node(
                job("a")
                    .retries(2, 10)
                    .props(Props::new().with("test.fail.below.attempt", "1")),
            )
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        let a = result.node("a").unwrap();
        assert_eq!(a.status, Status::Succeeded);
        assert_eq!(a.attempt, 1);
        assert_eq!(result.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_flow() {
        let h = Harness::new();
        let flow = FlowBuilder::new("hopeless")
            .node(failing("a").retries(1, 10))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;
        let a = result.node("a").unwrap();
        assert_eq!(a.status, Status::Failed);
        assert_eq!(a.attempt, 1);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(h.alerter.first_errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_all_failures_is_noop_without_failures() {
        let h = Harness::new();
        let flow = FlowBuilder::new("healthy")
            .node(sleeping("a", 300))
            .node(job("b").depends_on(["a"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.retry_failures("alice").await;

        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        let result = handle.snapshot().await;
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(result.node("a").unwrap().attempt, 0);
        assert_eq!(result.node("b").unwrap().attempt, 0);
    }

    #[tokio::test]
    async fn retry_all_failures_restarts_failed_branch() {
        let h = Harness::new();
        // a fails forever on attempt 0, succeeds from attempt 1 on; no
        // automatic retries so the flow parks in FAILED_FINISHING...
        // except a is an end node, so the flow fails. Use a downstream
        // node to keep the flow alive is impossible once finalized, so
        // drive the retry while a sibling is still running.
        let flow = FlowBuilder::new("manual_retry")
            .node(NodeSpec::job("a", "test").props(Props::new().with(
                "test.fail.below.attempt",
                "1",
            )))
            .node(sleeping("slow", 600))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);

        // wait until a has failed
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handle.node_status("a").await == Some(Status::Failed) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "a never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.retry_failures("alice").await;

        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        let result = handle.snapshot().await;
        assert_eq!(result.node("a").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("a").unwrap().attempt, 1);
        assert_eq!(result.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn retry_restores_cancelled_nodes_without_consuming_attempts() {
        let h = Harness::new();
        let flow = FlowBuilder::new("retry_cancelled")
            .node(job("a").props(Props::new().with("test.fail.below.attempt", "1")))
            .node(job("b").depends_on(["a"]))
            .node(sleeping("slow", 600))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);

        // a fails, which cancels b while slow keeps the flow alive
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handle.node_status("b").await == Some(Status::Cancelled) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "b never cancelled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.retry_failures("alice").await;

        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        let result = handle.snapshot().await;
        assert_eq!(result.status, Status::Succeeded);
        let a = result.node("a").unwrap();
        let b = result.node("b").unwrap();
        assert_eq!(a.status, Status::Succeeded);
        assert_eq!(a.attempt, 1);
        assert_eq!(b.status, Status::Succeeded);
        // b never ran before the retry, so its retry budget is untouched
        assert_eq!(b.attempt, 0);
    }

    #[tokio::test]
    async fn retry_reskips_disabled_nodes_on_the_failed_path() {
        let h = Harness::new();
        let flow = FlowBuilder::new("retry_skip")
            .node(job("a").props(Props::new().with("test.fail.below.attempt", "1")))
            .node(job("b").depends_on(["a"]).disabled())
            .node(job("c").depends_on(["b"]))
            .node(sleeping("slow", 600))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handle.node_status("a").await == Some(Status::Failed) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "a never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.retry_failures("alice").await;

        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        let result = handle.snapshot().await;
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(result.node("a").unwrap().status, Status::Succeeded);
        // b was re-skipped on the second pass and c ran behind it
        assert_eq!(result.node("b").unwrap().status, Status::Skipped);
        assert_eq!(result.node("c").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("c").unwrap().attempt, 0);
    }

    #[tokio::test]
    async fn kill_transitions_through_killing_to_killed() {
        let h = Harness::new();
        let flow = FlowBuilder::new("busy")
            .node(sleeping("a", 5_000))
            .node(sleeping("b", 5_000))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);

        // wait for both jobs to be running
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let a = handle.node_status("a").await;
            let b = handle.node_status("b").await;
            if a == Some(Status::Running) && b == Some(Status::Running) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "jobs never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.kill("alice").await;
        assert_eq!(handle.status().await, Status::Killing);

        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        let result = handle.snapshot().await;
        assert_eq!(result.status, Status::Killed);
        assert_eq!(result.node("a").unwrap().status, Status::Killed);
        assert_eq!(result.node("b").unwrap().status, Status::Killed);
    }

    #[tokio::test]
    async fn pause_blocks_traversal_until_resume() {
        let h = Harness::new();
        let flow = FlowBuilder::new("pausable")
            .node(sleeping("a", 150))
            .node(job("b").depends_on(["a"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let (handle, task) = h.launch(flow);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.pause("alice").await;
        assert_eq!(handle.status().await, Status::Paused);

        // a finishes while paused; b must not be dispatched
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.node_status("a").await, Some(Status::Succeeded));
        assert_eq!(handle.node_status("b").await, Some(Status::Ready));
        assert!(!handle.is_finished());

        handle.resume("alice").await;
        tokio::time::timeout(Duration::from_secs(10), handle.wait_finished())
            .await
            .unwrap();
        task.await.unwrap();
        assert_eq!(handle.snapshot().await.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn cancel_all_policy_kills_running_siblings() {
        let h = Harness::new();
        let options = ExecutionOptions {
            failure_action: FailureAction::CancelAll,
            ..Default::default()
        };
        let flow = FlowBuilder::new("fail_fast")
            .node(failing("a"))
            .node(sleeping("b", 5_000))
            .build(1, "alice", options)
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("a").unwrap().status, Status::Failed);
        assert_eq!(result.node("b").unwrap().status, Status::Killed);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn finish_all_possible_keeps_dispatching_after_failure() {
        let h = Harness::new();
        let options = ExecutionOptions {
            failure_action: FailureAction::FinishAllPossible,
            ..Default::default()
        };
        let flow = FlowBuilder::new("stubborn")
            .node(failing("a"))
            .node(sleeping("slow", 200))
            .node(job("b").depends_on(["slow"]))
            .build(1, "alice", options)
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("a").unwrap().status, Status::Failed);
        // b had not started when a failed, yet the policy still runs it
        assert_eq!(result.node("b").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn runtime_condition_gates_dispatch() {
        let h = Harness::new();
        let flow = FlowBuilder::new("conditional")
            .node(job("check").props(Props::new().with("test.output", "rows=250")))
            .node(
                job("small")
                    .depends_on(["check"])
                    .condition("${check:rows} < 100"),
            )
            .node(
                job("large")
                    .depends_on(["check"])
                    .condition("${check:rows} >= 100"),
            )
            .node(
                job("done")
                    .depends_on(["small", "large"])
                    .condition_on(ConditionOnJobStatus::AllDone),
            )
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("small").unwrap().status, Status::Cancelled);
        assert_eq!(result.node("large").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("done").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn disabled_node_is_skipped_and_downstream_proceeds() {
        let h = Harness::new();
        let flow = FlowBuilder::new("partial")
            .node(job("a"))
            .node(job("b").depends_on(["a"]).disabled())
            .node(job("c").depends_on(["b"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("b").unwrap().status, Status::Skipped);
        assert_eq!(result.node("c").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn embedded_subflow_failure_propagates_to_root() {
        let h = Harness::new();
        let flow = FlowBuilder::new("nested")
            .node(job("prep"))
            .node(
                NodeSpec::subflow(
                    "etl",
                    vec![job("extract"), failing("load").depends_on(["extract"])],
                )
                .depends_on(["prep"]),
            )
            .node(job("report").depends_on(["etl"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.node("etl:extract").unwrap().status, Status::Succeeded);
        assert_eq!(result.node("etl:load").unwrap().status, Status::Failed);
        assert_eq!(result.node("etl").unwrap().status, Status::Failed);
        assert_eq!(result.node("report").unwrap().status, Status::Cancelled);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn embedded_subflow_success_chains_outputs() {
        let h = Harness::new();
        let flow = FlowBuilder::new("nested_ok")
            .node(NodeSpec::subflow(
                "etl",
                vec![
                    job("extract"),
                    job("load")
                        .depends_on(["extract"])
                        .props(Props::new().with("test.output", "loaded=42")),
                ],
            ))
            .node(job("report").depends_on(["etl"]))
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.status, Status::Succeeded);
        let etl = result.node("etl").unwrap();
        assert_eq!(etl.status, Status::Succeeded);
        assert_eq!(etl.output_props.get("loaded"), Some("42"));
        // subflow output visible to its downstream dependents
        assert_eq!(
            result.node("report").unwrap().input_props.get("loaded"),
            Some("42")
        );
    }

    #[tokio::test]
    async fn pipelined_job_waits_for_watched_execution() {
        let h = Harness::new();
        let build = |execution_id| {
            FlowBuilder::new("pipeline")
                .node(sleeping("a", 250))
                .node(job("b").depends_on(["a"]))
                .build(execution_id, "alice", ExecutionOptions::default())
                .unwrap()
        };
        let (first, first_task) = h.launch(build(1));
        let watcher = Arc::new(LocalFlowWatcher::new(first.clone()));
        let settings = FlowRunnerSettings {
            watcher: Some(watcher),
            pipeline_level: 1,
            ..Default::default()
        };
        let (second, second_task) = h.launch_with(build(2), settings);

        tokio::time::timeout(Duration::from_secs(10), async {
            first.wait_finished().await;
            second.wait_finished().await;
        })
        .await
        .unwrap();
        first_task.await.unwrap();
        second_task.await.unwrap();

        let first_flow = first.snapshot().await;
        let second_flow = second.snapshot().await;
        assert_eq!(first_flow.status, Status::Succeeded);
        assert_eq!(second_flow.status, Status::Succeeded);
        // level 1: second execution's `a` starts only after the first
        // execution's `a` finished, local deps notwithstanding
        assert!(
            second_flow.node("a").unwrap().start_time.unwrap()
                >= first_flow.node("a").unwrap().end_time.unwrap()
        );
    }

    #[tokio::test]
    async fn one_success_join_fires_before_slow_sibling_finishes() {
        let h = Harness::new();
        let flow = FlowBuilder::new("race")
            .node(job("fast"))
            .node(sleeping("slow", 400))
            .node(
                job("winner")
                    .depends_on(["fast", "slow"])
                    .condition_on(ConditionOnJobStatus::OneSuccess),
            )
            .build(1, "alice", ExecutionOptions::default())
            .unwrap();
        let result = h.run_to_end(flow).await;

        assert_eq!(result.status, Status::Succeeded);
        let winner = result.node("winner").unwrap();
        let slow = result.node("slow").unwrap();
        assert_eq!(winner.status, Status::Succeeded);
        // the join satisfied mid-flight, before the slow upstream ended
        assert!(winner.start_time.unwrap() < slow.end_time.unwrap());
    }
}
