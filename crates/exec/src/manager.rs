//! Executor-wide orchestration.
//!
//! The manager owns every execution on this node: it admits submitted
//! flows up to the configured concurrency, prepares their directories,
//! wires pipeline watchers and SLA triggers, and keeps finished
//! executions queryable for a grace period. Background tasks poll the
//! store for queued work and clean up old state.

use chrono::Utc;
use flowdeck_core::{Alerter, ExecutorError, FlowStore, JobTypeRegistry, ProjectArchiveStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::flow_runner::{FlowRunner, FlowRunnerHandle, FlowRunnerSettings};
use crate::logfile::{self, flow_log_name, job_log_name};
use crate::preparer::FlowPreparer;
use crate::sla::TriggerManager;
use crate::watcher::{FlowWatcher, LocalFlowWatcher, RemoteFlowWatcher};

struct FinishedEntry {
    flow: flowdeck_core::ExecutableFlow,
    at: Instant,
}

/// Gate consulted before claiming queued work from the store.
pub trait HeadroomProbe: Send + Sync {
    fn has_headroom(&self) -> bool;
}

/// Reads /proc so an overloaded node stops taking on new flows. A
/// threshold of zero disables the corresponding gate, and a platform
/// without /proc always reports headroom.
pub struct SystemHeadroomProbe {
    min_free_memory_kb: u64,
    max_cpu_load: f64,
}

impl SystemHeadroomProbe {
    pub fn new(min_free_memory_kb: u64, max_cpu_load: f64) -> Self {
        Self {
            min_free_memory_kb,
            max_cpu_load,
        }
    }
}

impl HeadroomProbe for SystemHeadroomProbe {
    fn has_headroom(&self) -> bool {
        if self.min_free_memory_kb > 0 {
            if let Some(free_kb) = available_memory_kb() {
                if free_kb < self.min_free_memory_kb {
                    tracing::warn!(free_kb, "low memory, deferring new work");
                    return false;
                }
            }
        }
        if self.max_cpu_load > 0.0 {
            if let Some(load) = load_average() {
                if load > self.max_cpu_load {
                    tracing::warn!(load, "high load, deferring new work");
                    return false;
                }
            }
        }
        true
    }
}

fn available_memory_kb() -> Option<u64> {
    std::fs::read_to_string("/proc/meminfo")
        .ok()?
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

fn load_average() -> Option<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerMetrics {
    pub running_flows: usize,
    pub recently_finished: usize,
    pub preparing: usize,
    pub cache_hit_ratio: f64,
    pub active: bool,
}

pub struct FlowRunnerManager {
    config: ExecutorConfig,
    store: Arc<dyn FlowStore>,
    registry: Arc<JobTypeRegistry>,
    alerter: Arc<dyn Alerter>,
    preparer: Arc<FlowPreparer>,
    triggers: TriggerManager,
    flow_sem: Arc<Semaphore>,
    running: RwLock<HashMap<i64, FlowRunnerHandle>>,
    recently_finished: RwLock<HashMap<i64, FinishedEntry>>,
    /// Submissions between admission and runner start; drain waits on it.
    preparing: AtomicUsize,
    active: AtomicBool,
    headroom: StdRwLock<Arc<dyn HeadroomProbe>>,
    shutdown: CancellationToken,
}

impl FlowRunnerManager {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn FlowStore>,
        archive_store: Arc<dyn ProjectArchiveStore>,
        registry: Arc<JobTypeRegistry>,
        alerter: Arc<dyn Alerter>,
    ) -> anyhow::Result<Arc<Self>> {
        let preparer = Arc::new(FlowPreparer::new(
            archive_store,
            config.project_cache_dir(),
            config.execution_dir(),
            config.project_cache_size_bytes(),
        )?);
        let flow_sem = Arc::new(Semaphore::new(config.pools.num_flow_threads.max(1)));
        let headroom: Arc<dyn HeadroomProbe> = Arc::new(SystemHeadroomProbe::new(
            config.polling.min_free_memory_kb,
            config.polling.max_cpu_load,
        ));
        Ok(Arc::new(Self {
            store,
            registry,
            alerter: alerter.clone(),
            preparer,
            triggers: TriggerManager::new(alerter),
            flow_sem,
            running: RwLock::new(HashMap::new()),
            recently_finished: RwLock::new(HashMap::new()),
            preparing: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            headroom: StdRwLock::new(headroom),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    /// Replace the headroom probe, e.g. with a deployment-specific one.
    pub fn set_headroom_probe(&self, probe: Arc<dyn HeadroomProbe>) {
        *self.headroom.write().expect("headroom probe lock poisoned") = probe;
    }

    /// Start the store poller and the periodic cleaner.
    pub fn start(self: &Arc<Self>) {
        if self.config.polling.enabled {
            let manager = self.clone();
            tokio::spawn(async move { manager.poll_loop().await });
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.clean_loop().await });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        tracing::info!(active, "executor activity changed");
    }

    /// Stop admitting work and wait for in-flight submissions to land.
    /// Already-running flows keep running.
    pub async fn drain(&self) {
        self.set_active(false);
        while self.preparing.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn is_running(&self, execution_id: i64) -> bool {
        self.running.read().await.contains_key(&execution_id)
    }

    pub async fn handle(&self, execution_id: i64) -> Option<FlowRunnerHandle> {
        self.running.read().await.get(&execution_id).cloned()
    }

    pub async fn metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            running_flows: self.running.read().await.len(),
            recently_finished: self.recently_finished.read().await.len(),
            preparing: self.preparing.load(Ordering::SeqCst),
            cache_hit_ratio: self.preparer.cache_hit_ratio(),
            active: self.active.load(Ordering::SeqCst),
        }
    }

    /// Admit a submitted execution. Submitting an execution that is
    /// already running is a no-op.
    pub async fn submit_flow(self: &Arc<Self>, execution_id: i64) -> Result<(), ExecutorError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(ExecutorError::Inactive);
        }
        if self.is_running(execution_id).await {
            tracing::warn!(execution_id, "execution already running, ignoring submit");
            return Ok(());
        }
        self.preparing.fetch_add(1, Ordering::SeqCst);
        let result = self.admit(execution_id).await;
        self.preparing.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn admit(self: &Arc<Self>, execution_id: i64) -> Result<(), ExecutorError> {
        let flow = self.store.fetch_flow(execution_id).await?;
        let execution_dir = self
            .preparer
            .setup(&flow)
            .await
            .map_err(ExecutorError::Prepare)?;

        let watcher = match flow.options.pipeline_execution_id {
            None => None,
            Some(watched) => Some(self.watcher_for(watched).await),
        };
        let settings = FlowRunnerSettings {
            num_job_threads: self
                .config
                .effective_job_threads(flow.options.num_job_threads, flow.project_id),
            check_interval: self.config.flow_check_interval(),
            validate_proxy_user: self.config.validate_proxy_user,
            pipeline_level: flow.options.pipeline_level.unwrap_or(1),
            watcher,
        };
        let sla_options = flow.sla_options.clone();
        let (runner, handle) = FlowRunner::new(
            flow,
            execution_dir,
            self.store.clone(),
            self.registry.clone(),
            self.alerter.clone(),
            settings,
        )
        .map_err(ExecutorError::Prepare)?;

        {
            let mut running = self.running.write().await;
            if running.contains_key(&execution_id) {
                tracing::warn!(execution_id, "execution already running, ignoring submit");
                return Ok(());
            }
            running.insert(execution_id, handle.clone());
        }
        self.triggers.register(&handle, &sla_options);
        tracing::info!(
            execution_id,
            flow_id = %handle.flow_id(),
            "execution admitted"
        );

        let manager = self.clone();
        let sem = self.flow_sem.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.expect("flow semaphore closed");
            runner.run().await;
            manager.retire(execution_id).await;
        });
        Ok(())
    }

    /// Watch a local execution in-process, a remote one via the store.
    async fn watcher_for(&self, watched: i64) -> Arc<dyn FlowWatcher> {
        match self.running.read().await.get(&watched) {
            Some(handle) => Arc::new(LocalFlowWatcher::new(handle.clone())),
            None => Arc::new(RemoteFlowWatcher::new(
                watched,
                self.store.clone(),
                Duration::from_millis(self.config.polling.interval_ms),
            )),
        }
    }

    async fn retire(&self, execution_id: i64) {
        let handle = self.running.write().await.remove(&execution_id);
        if let Some(handle) = handle {
            let flow = handle.snapshot().await;
            tracing::info!(execution_id, status = %flow.status, "execution retired");
            self.recently_finished.write().await.insert(
                execution_id,
                FinishedEntry {
                    flow,
                    at: Instant::now(),
                },
            );
        }
    }

    pub async fn pause_flow(&self, execution_id: i64, user: &str) -> Result<(), ExecutorError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        handle.pause(user).await;
        Ok(())
    }

    pub async fn resume_flow(&self, execution_id: i64, user: &str) -> Result<(), ExecutorError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        handle.resume(user).await;
        Ok(())
    }

    pub async fn kill_flow(&self, execution_id: i64, user: &str) -> Result<(), ExecutorError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        handle.kill(user).await;
        Ok(())
    }

    pub async fn retry_failures(
        &self,
        execution_id: i64,
        user: &str,
    ) -> Result<(), ExecutorError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        handle.retry_failures(user).await;
        Ok(())
    }

    pub async fn kill_job(
        &self,
        execution_id: i64,
        nested_id: &str,
    ) -> Result<bool, ExecutorError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        Ok(handle.kill_job(nested_id, false).await)
    }

    /// Chunked read of a local flow log. Serves running and recently
    /// finished executions.
    pub async fn read_flow_log(
        &self,
        execution_id: i64,
        offset: u64,
        length: usize,
    ) -> Result<(Vec<u8>, usize), ExecutorError> {
        let path = match self.handle(execution_id).await {
            Some(handle) => handle.flow_log_path(),
            None => {
                let recent = self.recently_finished.read().await;
                let entry = recent
                    .get(&execution_id)
                    .ok_or(ExecutorError::NotRunning(execution_id))?;
                self.preparer
                    .execution_dir(execution_id)
                    .join(flow_log_name(execution_id, &entry.flow.flow_id))
            }
        };
        logfile::read_chunk(&path, offset, length).map_err(ExecutorError::Store)
    }

    pub async fn read_job_log(
        &self,
        execution_id: i64,
        nested_id: &str,
        attempt: u32,
        offset: u64,
        length: usize,
    ) -> Result<(Vec<u8>, usize), ExecutorError> {
        if !self.is_running(execution_id).await
            && !self
                .recently_finished
                .read()
                .await
                .contains_key(&execution_id)
        {
            return Err(ExecutorError::NotRunning(execution_id));
        }
        let path = self
            .preparer
            .execution_dir(execution_id)
            .join(job_log_name(execution_id, nested_id, attempt));
        logfile::read_chunk(&path, offset, length).map_err(ExecutorError::Store)
    }

    async fn poll_loop(self: Arc<Self>) {
        let base = Duration::from_millis(self.config.polling.interval_ms.max(1));
        let ceiling = Duration::from_millis(self.config.polling.max_backoff_ms.max(1));
        let mut backoff = base;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            let has_headroom = self
                .headroom
                .read()
                .expect("headroom probe lock poisoned")
                .has_headroom();
            if !self.active.load(Ordering::SeqCst)
                || self.flow_sem.available_permits() == 0
                || !has_headroom
            {
                backoff = base;
                continue;
            }
            match self.store.claim_next_queued().await {
                Ok(Some(execution_id)) => {
                    backoff = base;
                    if let Err(e) = self.submit_flow(execution_id).await {
                        tracing::error!(execution_id, error = %e, "claimed execution rejected");
                    }
                }
                Ok(None) => backoff = base,
                Err(e) => {
                    backoff = (backoff * 2).min(ceiling);
                    tracing::warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "poll failed");
                }
            }
        }
    }

    async fn clean_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.cleaner.interval_secs.max(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.evict_recently_finished().await;
            self.kill_overrunning_flows().await;
            if let Err(e) = self.delete_old_execution_dirs().await {
                tracing::warn!(error = %e, "execution dir cleanup failed");
            }
        }
    }

    async fn evict_recently_finished(&self) {
        let ttl = Duration::from_secs(self.config.cleaner.recently_finished_ttl_secs);
        self.recently_finished
            .write()
            .await
            .retain(|_, entry| entry.at.elapsed() < ttl);
    }

    async fn kill_overrunning_flows(&self) {
        let max = self.config.cleaner.flow_max_running_secs;
        if max == 0 {
            return;
        }
        let handles: Vec<FlowRunnerHandle> = self.running.read().await.values().cloned().collect();
        for handle in handles {
            let Some(started) = handle.start_time().await else {
                continue;
            };
            let running_secs = (Utc::now() - started).num_seconds();
            if running_secs > max as i64 {
                tracing::warn!(
                    execution_id = handle.execution_id(),
                    running_secs,
                    "flow exceeded maximum run time, killing"
                );
                handle.kill("cleaner").await;
            }
        }
    }

    /// Delete execution directories past retention, skipping anything
    /// still running or recently finished.
    async fn delete_old_execution_dirs(&self) -> anyhow::Result<()> {
        let retention = Duration::from_secs(self.config.cleaner.execution_dir_retention_secs);
        let root = self.config.execution_dir();
        let mut keep: Vec<i64> = self.running.read().await.keys().copied().collect();
        keep.extend(self.recently_finished.read().await.keys().copied());

        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(execution_id) = entry.file_name().to_string_lossy().parse::<i64>() else {
                continue;
            };
            if keep.contains(&execution_id) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > retention)
                .unwrap_or(false);
            if old_enough {
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(execution_id, error = %e, "could not delete execution dir");
                } else {
                    tracing::info!(execution_id, "deleted old execution dir");
                }
            }
        }
        Ok(())
    }
}
