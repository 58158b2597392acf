//! Watching another execution's progress for pipelined runs.
//!
//! A pipelined execution blocks some of its jobs until corresponding
//! work in a previous execution of the same flow has finished. When the
//! watched execution runs on this executor the watcher reads its state
//! in-process; otherwise it polls the store.

use async_trait::async_trait;
use flowdeck_core::{FlowStore, Status};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::flow_runner::FlowRunnerHandle;

/// One thing a blocked job waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchTarget {
    /// A node of the watched execution, by nested id.
    Node(String),
    /// The watched execution as a whole.
    Flow,
}

#[async_trait]
pub trait FlowWatcher: Send + Sync {
    fn execution_id(&self) -> i64;

    /// Current status of a watched node; None if the node is unknown.
    async fn node_status(&self, nested_id: &str) -> Option<Status>;

    async fn flow_status(&self) -> Option<Status>;

    fn poll_interval(&self) -> Duration;

    fn stop_token(&self) -> &CancellationToken;

    /// Release all waiters without waiting for the watched execution.
    fn stop(&self) {
        self.stop_token().cancel();
    }

    /// Block until the target finishes, the watch is stopped, or the
    /// given token is cancelled. Returns the final status if observed.
    async fn wait_finished(
        &self,
        target: &WatchTarget,
        cancel: &CancellationToken,
    ) -> Option<Status> {
        loop {
            let status = match target {
                WatchTarget::Node(id) => self.node_status(id).await,
                WatchTarget::Flow => self.flow_status().await,
            };
            match status {
                // An unknown node can never finish; do not block on it.
                None => return None,
                Some(s) if s.is_finished() => return Some(s),
                Some(_) => {}
            }
            tokio::select! {
                _ = self.stop_token().cancelled() => return None,
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }
}

/// Watches an execution running in this process.
pub struct LocalFlowWatcher {
    handle: FlowRunnerHandle,
    stop: CancellationToken,
}

impl LocalFlowWatcher {
    pub fn new(handle: FlowRunnerHandle) -> Self {
        Self {
            handle,
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl FlowWatcher for LocalFlowWatcher {
    fn execution_id(&self) -> i64 {
        self.handle.execution_id()
    }

    async fn node_status(&self, nested_id: &str) -> Option<Status> {
        self.handle.node_status(nested_id).await
    }

    async fn flow_status(&self) -> Option<Status> {
        Some(self.handle.status().await)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

/// Watches an execution owned by another executor through the store.
pub struct RemoteFlowWatcher {
    execution_id: i64,
    store: Arc<dyn FlowStore>,
    poll_interval: Duration,
    stop: CancellationToken,
}

impl RemoteFlowWatcher {
    pub fn new(execution_id: i64, store: Arc<dyn FlowStore>, poll_interval: Duration) -> Self {
        Self {
            execution_id,
            store,
            poll_interval,
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl FlowWatcher for RemoteFlowWatcher {
    fn execution_id(&self) -> i64 {
        self.execution_id
    }

    async fn node_status(&self, nested_id: &str) -> Option<Status> {
        match self.store.fetch_node_statuses(self.execution_id).await {
            Ok(statuses) => statuses.get(nested_id).copied(),
            Err(e) => {
                tracing::warn!(
                    execution_id = self.execution_id,
                    error = %e,
                    "watcher failed to fetch node statuses"
                );
                // Transient store errors must not unblock the waiter.
                Some(Status::Running)
            }
        }
    }

    async fn flow_status(&self) -> Option<Status> {
        match self.store.fetch_flow(self.execution_id).await {
            Ok(flow) => Some(flow.status),
            Err(e) => {
                tracing::warn!(
                    execution_id = self.execution_id,
                    error = %e,
                    "watcher failed to fetch flow"
                );
                Some(Status::Running)
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}
