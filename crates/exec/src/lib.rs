// Flowdeck executor: runs DAG workflow executions on a single node.

mod cache;
pub mod config;
pub mod flow_runner;
pub mod job_runner;
pub mod logfile;
pub mod manager;
pub mod preparer;
pub mod sla;
pub mod watcher;

pub use config::ExecutorConfig;
pub use flow_runner::{FlowRunner, FlowRunnerHandle, FlowRunnerSettings};
pub use manager::{FlowRunnerManager, HeadroomProbe, ManagerMetrics, SystemHeadroomProbe};
pub use preparer::FlowPreparer;
pub use sla::TriggerManager;
pub use watcher::{FlowWatcher, LocalFlowWatcher, RemoteFlowWatcher, WatchTarget};
