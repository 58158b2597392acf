use crate::error::ExecutorError;
use crate::flow::ExecutableFlow;
use crate::node::ExecutableNode;
use crate::sla::SlaOption;
use crate::status::Status;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

/// Durable view of executions shared with the rest of the system. The
/// executor persists snapshots through this seam and polls it for work.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn fetch_flow(&self, execution_id: i64) -> Result<ExecutableFlow, ExecutorError>;

    async fn update_flow(&self, flow: &ExecutableFlow) -> Result<(), ExecutorError>;

    async fn update_node(
        &self,
        execution_id: i64,
        node: &ExecutableNode,
    ) -> Result<(), ExecutorError>;

    /// Persist a finished log. `source` is a flow id or a node nested id.
    async fn upload_log(
        &self,
        execution_id: i64,
        source: &str,
        attempt: u32,
        data: Bytes,
    ) -> Result<(), ExecutorError>;

    /// Pop the next queued execution assigned to this executor, if any.
    async fn claim_next_queued(&self) -> Result<Option<i64>, ExecutorError>;

    /// Node statuses of a (possibly remote) execution, for watchers.
    async fn fetch_node_statuses(
        &self,
        execution_id: i64,
    ) -> Result<HashMap<String, Status>, ExecutorError>;
}

/// Source of project archives for execution preparation. Returns a
/// local path to a `.tar.gz` bundle.
#[async_trait]
pub trait ProjectArchiveStore: Send + Sync {
    async fn fetch_archive(
        &self,
        project_id: i32,
        version: i32,
    ) -> Result<PathBuf, ExecutorError>;
}

/// Outbound notifications. Failures here are logged, never fatal.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert_first_error(&self, flow: &ExecutableFlow);
    async fn alert_flow_finished(&self, flow: &ExecutableFlow);
    async fn alert_sla(&self, option: &SlaOption, message: &str);
}

pub struct NoopAlerter;

#[async_trait]
impl Alerter for NoopAlerter {
    async fn alert_first_error(&self, _flow: &ExecutableFlow) {}
    async fn alert_flow_finished(&self, _flow: &ExecutableFlow) {}
    async fn alert_sla(&self, _option: &SlaOption, _message: &str) {}
}

/// In-memory store, used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: RwLock<HashMap<i64, ExecutableFlow>>,
    logs: RwLock<HashMap<(i64, String, u32), Bytes>>,
    queue: Mutex<VecDeque<i64>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_flow(&self, flow: ExecutableFlow) {
        self.flows
            .write()
            .expect("flow store lock poisoned")
            .insert(flow.execution_id, flow);
    }

    pub fn enqueue(&self, execution_id: i64) {
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push_back(execution_id);
    }

    pub fn log_of(&self, execution_id: i64, source: &str, attempt: u32) -> Option<Bytes> {
        self.logs
            .read()
            .expect("log lock poisoned")
            .get(&(execution_id, source.to_string(), attempt))
            .cloned()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn fetch_flow(&self, execution_id: i64) -> Result<ExecutableFlow, ExecutorError> {
        self.flows
            .read()
            .expect("flow store lock poisoned")
            .get(&execution_id)
            .cloned()
            .ok_or(ExecutorError::FlowNotFound(execution_id))
    }

    async fn update_flow(&self, flow: &ExecutableFlow) -> Result<(), ExecutorError> {
        self.flows
            .write()
            .expect("flow store lock poisoned")
            .insert(flow.execution_id, flow.clone());
        Ok(())
    }

    async fn update_node(
        &self,
        execution_id: i64,
        node: &ExecutableNode,
    ) -> Result<(), ExecutorError> {
        let mut flows = self.flows.write().expect("flow store lock poisoned");
        let flow = flows
            .get_mut(&execution_id)
            .ok_or(ExecutorError::FlowNotFound(execution_id))?;
        if let Some(slot) = flow.node_mut(&node.nested_id) {
            *slot = node.clone();
        }
        Ok(())
    }

    async fn upload_log(
        &self,
        execution_id: i64,
        source: &str,
        attempt: u32,
        data: Bytes,
    ) -> Result<(), ExecutorError> {
        self.logs
            .write()
            .expect("log lock poisoned")
            .insert((execution_id, source.to_string(), attempt), data);
        Ok(())
    }

    async fn claim_next_queued(&self) -> Result<Option<i64>, ExecutorError> {
        Ok(self.queue.lock().expect("queue lock poisoned").pop_front())
    }

    async fn fetch_node_statuses(
        &self,
        execution_id: i64,
    ) -> Result<HashMap<String, Status>, ExecutorError> {
        let flows = self.flows.read().expect("flow store lock poisoned");
        let flow = flows
            .get(&execution_id)
            .ok_or(ExecutorError::FlowNotFound(execution_id))?;
        Ok(flow
            .nodes()
            .map(|n| (n.nested_id.clone(), n.status))
            .collect())
    }
}
