use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub dirs: DirConfig,

    #[serde(default)]
    pub pools: PoolConfig,

    #[serde(default)]
    pub cleaner: CleanerConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    /// Explicit proxy users must be listed on the flow when enabled.
    #[serde(default)]
    pub validate_proxy_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirConfig {
    #[serde(default = "default_execution_dir")]
    pub execution_dir: String,

    #[serde(default = "default_project_cache_dir")]
    pub project_cache_dir: String,

    /// 0 disables cache eviction.
    #[serde(default = "default_project_cache_size_mb")]
    pub project_cache_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Flows running concurrently on this executor.
    #[serde(default = "default_num_flow_threads")]
    pub num_flow_threads: usize,

    /// Jobs running concurrently within one flow.
    #[serde(default = "default_num_job_threads")]
    pub num_job_threads: usize,

    /// Upper bound a flow may request via its options.
    #[serde(default = "default_max_job_threads")]
    pub max_job_threads: usize,

    /// Projects allowed to exceed max_job_threads.
    #[serde(default)]
    pub job_thread_override_projects: Vec<i32>,

    /// Self-heal wakeup when no job events arrive.
    #[serde(default = "default_flow_check_interval_secs")]
    pub flow_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_cleaner_interval_secs")]
    pub interval_secs: u64,

    /// How long finished executions stay queryable in memory.
    #[serde(default = "default_recently_finished_ttl_secs")]
    pub recently_finished_ttl_secs: u64,

    /// Execution directories older than this are deleted.
    #[serde(default = "default_execution_dir_retention_secs")]
    pub execution_dir_retention_secs: u64,

    /// Flows running longer than this are force-killed. 0 disables.
    #[serde(default = "default_flow_max_running_secs")]
    pub flow_max_running_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_enabled")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Backoff ceiling after consecutive polling failures.
    #[serde(default = "default_poll_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Minimum available memory to claim new work. 0 disables the gate.
    #[serde(default)]
    pub min_free_memory_kb: u64,

    /// Maximum one-minute load average to claim new work. 0 disables
    /// the gate.
    #[serde(default)]
    pub max_cpu_load: f64,
}

fn default_execution_dir() -> String {
    "executions".to_string()
}

fn default_project_cache_dir() -> String {
    "projects".to_string()
}

fn default_project_cache_size_mb() -> u64 {
    4096
}

fn default_num_flow_threads() -> usize {
    30
}

fn default_num_job_threads() -> usize {
    10
}

fn default_max_job_threads() -> usize {
    20
}

fn default_flow_check_interval_secs() -> u64 {
    300
}

fn default_cleaner_interval_secs() -> u64 {
    300
}

fn default_recently_finished_ttl_secs() -> u64 {
    120
}

fn default_execution_dir_retention_secs() -> u64 {
    86_400
}

fn default_flow_max_running_secs() -> u64 {
    864_000
}

fn default_poll_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_poll_max_backoff_ms() -> u64 {
    60_000
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            execution_dir: default_execution_dir(),
            project_cache_dir: default_project_cache_dir(),
            project_cache_size_mb: default_project_cache_size_mb(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_flow_threads: default_num_flow_threads(),
            num_job_threads: default_num_job_threads(),
            max_job_threads: default_max_job_threads(),
            job_thread_override_projects: Vec::new(),
            flow_check_interval_secs: default_flow_check_interval_secs(),
        }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleaner_interval_secs(),
            recently_finished_ttl_secs: default_recently_finished_ttl_secs(),
            execution_dir_retention_secs: default_execution_dir_retention_secs(),
            flow_max_running_secs: default_flow_max_running_secs(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: default_poll_enabled(),
            interval_ms: default_poll_interval_ms(),
            max_backoff_ms: default_poll_max_backoff_ms(),
            min_free_memory_kb: 0,
            max_cpu_load: 0.0,
        }
    }
}

impl ExecutorConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            dirs: Default::default(),
            pools: Default::default(),
            cleaner: Default::default(),
            polling: Default::default(),
            validate_proxy_user: false,
        }
    }

    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::with_data_dir(data_dir.clone())
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn execution_dir(&self) -> PathBuf {
        self.data_dir.join(&self.dirs.execution_dir)
    }

    pub fn project_cache_dir(&self) -> PathBuf {
        self.data_dir.join(&self.dirs.project_cache_dir)
    }

    pub fn project_cache_size_bytes(&self) -> u64 {
        self.dirs.project_cache_size_mb * 1024 * 1024
    }

    pub fn flow_check_interval(&self) -> Duration {
        Duration::from_secs(self.pools.flow_check_interval_secs)
    }

    /// Effective per-flow job concurrency for a project, honoring the
    /// requested override and the configured cap.
    pub fn effective_job_threads(&self, requested: Option<usize>, project_id: i32) -> usize {
        match requested {
            None => self.pools.num_job_threads,
            Some(n) => {
                if self
                    .pools
                    .job_thread_override_projects
                    .contains(&project_id)
                {
                    n.max(1)
                } else {
                    n.clamp(1, self.pools.max_job_threads)
                }
            }
        }
    }
}
