// Core types and storage seams for the Flowdeck workflow executor

pub mod condition;
pub mod error;
pub mod expr;
pub mod flow;
pub mod jobtype;
pub mod node;
pub mod options;
pub mod props;
pub mod sla;
pub mod status;
pub mod store;

pub use condition::{check_condition_on_job_status, ConditionOnJobStatus, ConditionResult};
pub use error::ExecutorError;
pub use flow::{ExecutableFlow, FlowBuilder, NodeSpec, NESTED_ID_SEPARATOR};
pub use jobtype::{Job, JobContext, JobLogger, JobTypeRegistry};
pub use node::{ExecutableNode, NodeKind};
pub use options::{ExecutionOptions, FailureAction};
pub use props::Props;
pub use sla::{SlaAction, SlaOption, SlaType};
pub use status::Status;
pub use store::{Alerter, FlowStore, MemoryFlowStore, NoopAlerter, ProjectArchiveStore};
