use crate::error::ExecutorError;
use crate::props::Props;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Sink for a job's own log lines, backed by the per-job log file.
pub trait JobLogger: Send + Sync {
    fn line(&self, msg: &str);
}

/// Everything a job sees at run time.
pub struct JobContext {
    pub execution_id: i64,
    pub nested_id: String,
    pub attempt: u32,
    pub working_dir: PathBuf,
    pub props: Props,
    /// User the work runs as after proxy resolution.
    pub effective_user: String,
    pub log: Arc<dyn JobLogger>,
}

/// A runnable unit of work. `cancel` is called from another task when
/// the execution is killed; implementations unblock `run` promptly.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Props>;

    fn cancel(&self) {}
}

type JobFactory = Box<dyn Fn(&Props) -> anyhow::Result<Arc<dyn Job>> + Send + Sync>;

struct JobTypeEntry {
    factory: JobFactory,
    default_proxy_user: Option<String>,
}

/// Maps job type names to factories. Registered once at startup;
/// plugins may add entries later, hence the lock.
#[derive(Default)]
pub struct JobTypeRegistry {
    types: RwLock<HashMap<String, JobTypeEntry>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Props) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.types.write().expect("registry lock poisoned").insert(
            name.into(),
            JobTypeEntry {
                factory: Box::new(factory),
                default_proxy_user: None,
            },
        );
    }

    /// Register a job type whose work always runs as a fixed system
    /// user unless the job overrides it.
    pub fn register_with_proxy<F>(
        &self,
        name: impl Into<String>,
        default_proxy_user: impl Into<String>,
        factory: F,
    ) where
        F: Fn(&Props) -> anyhow::Result<Arc<dyn Job>> + Send + Sync + 'static,
    {
        self.types.write().expect("registry lock poisoned").insert(
            name.into(),
            JobTypeEntry {
                factory: Box::new(factory),
                default_proxy_user: Some(default_proxy_user.into()),
            },
        );
    }

    pub fn create(&self, job_type: &str, props: &Props) -> Result<Arc<dyn Job>, ExecutorError> {
        let types = self.types.read().expect("registry lock poisoned");
        let entry = types
            .get(job_type)
            .ok_or_else(|| ExecutorError::JobType(job_type.to_string()))?;
        (entry.factory)(props).map_err(|e| ExecutorError::JobType(format!("{job_type}: {e}")))
    }

    pub fn default_proxy_user(&self, job_type: &str) -> Option<String> {
        self.types
            .read()
            .expect("registry lock poisoned")
            .get(job_type)
            .and_then(|e| e.default_proxy_user.clone())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.types
            .read()
            .expect("registry lock poisoned")
            .contains_key(job_type)
    }
}
