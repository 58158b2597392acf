//! Execution directory preparation.
//!
//! Before a flow runs, its project archive is unpacked into a shared
//! per-version cache and the cached tree is hard-linked into a private
//! execution directory. Unpacking happens in a staging directory and is
//! installed into the cache with a rename, so concurrent preparations
//! never observe a half-unpacked project.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flowdeck_core::{ExecutableFlow, ProjectArchiveStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::{
    project_dir_name, write_sentinel, ProjectCacheCleaner, PROJECT_DIR_SIZE_FILE,
};

pub struct FlowPreparer {
    archive_store: Arc<dyn ProjectArchiveStore>,
    cache_dir: PathBuf,
    execution_root: PathBuf,
    cleaner: Option<ProjectCacheCleaner>,
    /// Serializes cache installs and evictions.
    cache_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FlowPreparer {
    pub fn new(
        archive_store: Arc<dyn ProjectArchiveStore>,
        cache_dir: PathBuf,
        execution_root: PathBuf,
        max_cache_bytes: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("creating project cache dir {}", cache_dir.display()))?;
        std::fs::create_dir_all(&execution_root)
            .with_context(|| format!("creating execution root {}", execution_root.display()))?;
        let cleaner = (max_cache_bytes > 0)
            .then(|| ProjectCacheCleaner::new(cache_dir.clone(), max_cache_bytes));
        Ok(Self {
            archive_store,
            cache_dir,
            execution_root,
            cleaner,
            cache_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn execution_dir(&self, execution_id: i64) -> PathBuf {
        self.execution_root.join(execution_id.to_string())
    }

    /// Ready the execution directory for a flow and return its path.
    pub async fn setup(&self, flow: &ExecutableFlow) -> Result<PathBuf> {
        let execution_dir = self.execution_dir(flow.execution_id);
        std::fs::create_dir_all(&execution_dir).with_context(|| {
            format!("creating execution dir {}", execution_dir.display())
        })?;

        let project_dir = self
            .cache_dir
            .join(project_dir_name(flow.project_id, flow.version));

        {
            let _guard = self.cache_lock.lock().await;
            if project_dir.is_dir() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    project_id = flow.project_id,
                    version = flow.version,
                    "project cache hit"
                );
                touch_access(&project_dir)?;
                link_tree(&project_dir, &execution_dir)?;
                return Ok(execution_dir);
            }
        }

        // Fetch and unpack outside the lock; one slow download must not
        // stall every other preparation.
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            project_id = flow.project_id,
            version = flow.version,
            "project cache miss, fetching archive"
        );
        let (staging, size) = self.stage(flow.project_id, flow.version).await?;

        let _guard = self.cache_lock.lock().await;
        if project_dir.is_dir() {
            // A concurrent preparation installed this version while we
            // were unpacking; use its copy and discard the staged one.
            touch_access(&project_dir)?;
        } else {
            if let Some(cleaner) = &self.cleaner {
                cleaner.delete_if_necessary(size)?;
            }
            let staged = staging.into_path();
            std::fs::rename(&staged, &project_dir).with_context(|| {
                format!("installing project into {}", project_dir.display())
            })?;
            tracing::info!(
                project_id = flow.project_id,
                version = flow.version,
                size_bytes = size,
                "project cached"
            );
        }

        link_tree(&project_dir, &execution_dir)?;
        Ok(execution_dir)
    }

    async fn stage(&self, project_id: i32, version: i32) -> Result<(tempfile::TempDir, u64)> {
        let archive = self.archive_store.fetch_archive(project_id, version).await?;
        let staging = tempfile::Builder::new()
            .prefix(".install-")
            .tempdir_in(&self.cache_dir)
            .context("creating staging directory")?;

        let file = std::fs::File::open(&archive)
            .with_context(|| format!("opening archive {}", archive.display()))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(staging.path())
            .with_context(|| format!("unpacking archive {}", archive.display()))?;

        let size = directory_size(staging.path());
        write_sentinel(staging.path(), size)?;
        Ok((staging, size))
    }

    /// Fraction of preparations served from the cache.
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

fn touch_access(project_dir: &Path) -> Result<()> {
    let sentinel = project_dir.join(PROJECT_DIR_SIZE_FILE);
    let size = std::fs::read_to_string(&sentinel)
        .with_context(|| format!("reading size sentinel {}", sentinel.display()))?;
    std::fs::write(&sentinel, size)
        .with_context(|| format!("touching size sentinel {}", sentinel.display()))
}

fn directory_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Mirror the cached project into the execution directory with hard
/// links, copying where linking is not possible.
fn link_tree(project_dir: &Path, execution_dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(project_dir).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(project_dir)
            .expect("walkdir yielded a path outside its root");
        if relative == Path::new(PROJECT_DIR_SIZE_FILE) {
            continue;
        }
        let target = execution_dir.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else if std::fs::hard_link(entry.path(), &target).is_err() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowdeck_core::{ExecutionOptions, ExecutorError, FlowBuilder, NodeSpec};
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct FakeArchiveStore {
        dir: TempDir,
        fetches: AtomicUsize,
        delay_ms: u64,
    }

    impl FakeArchiveStore {
        fn new() -> Self {
            Self::slow(0)
        }

        fn slow(delay_ms: u64) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                fetches: AtomicUsize::new(0),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl ProjectArchiveStore for FakeArchiveStore {
        async fn fetch_archive(
            &self,
            project_id: i32,
            version: i32,
        ) -> Result<PathBuf, ExecutorError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let path = self.dir.path().join(format!("{project_id}-{version}.tar.gz"));
            let file = std::fs::File::create(&path).unwrap();
            let mut tar = tar::Builder::new(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            ));
            let content = format!("project={project_id} version={version}\n").repeat(50);
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, "job.properties", content.as_bytes())
                .unwrap();
            tar.into_inner().unwrap().finish().unwrap().flush().unwrap();
            Ok(path)
        }
    }

    fn flow(execution_id: i64, project_id: i32, version: i32) -> flowdeck_core::ExecutableFlow {
        FlowBuilder::new("prep")
            .project(project_id, version)
            .node(NodeSpec::job("a", "test"))
            .build(execution_id, "alice", ExecutionOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn setup_unpacks_once_and_links_per_execution() {
        let data = TempDir::new().unwrap();
        let archives = Arc::new(FakeArchiveStore::new());
        let preparer = FlowPreparer::new(
            archives.clone(),
            data.path().join("projects"),
            data.path().join("executions"),
            0,
        )
        .unwrap();

        let first = preparer.setup(&flow(1, 7, 2)).await.unwrap();
        let second = preparer.setup(&flow(2, 7, 2)).await.unwrap();

        assert!(first.join("job.properties").is_file());
        assert!(second.join("job.properties").is_file());
        assert_ne!(first, second);
        // second execution was served from the cache
        assert_eq!(archives.fetches.load(Ordering::SeqCst), 1);
        assert!((preparer.cache_hit_ratio() - 0.5).abs() < f64::EPSILON);
        // the sentinel stays out of execution directories
        assert!(!first.join(PROJECT_DIR_SIZE_FILE).exists());
    }

    #[tokio::test]
    async fn new_version_misses_the_cache() {
        let data = TempDir::new().unwrap();
        let archives = Arc::new(FakeArchiveStore::new());
        let preparer = FlowPreparer::new(
            archives.clone(),
            data.path().join("projects"),
            data.path().join("executions"),
            0,
        )
        .unwrap();

        preparer.setup(&flow(1, 7, 1)).await.unwrap();
        preparer.setup(&flow(2, 7, 2)).await.unwrap();
        assert_eq!(archives.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tight_cache_evicts_older_version_on_install() {
        let data = TempDir::new().unwrap();
        let archives = Arc::new(FakeArchiveStore::new());
        let cache_dir = data.path().join("projects");
        // fits one unpacked project but not two
        let preparer = FlowPreparer::new(
            archives,
            cache_dir.clone(),
            data.path().join("executions"),
            1_000,
        )
        .unwrap();

        preparer.setup(&flow(1, 7, 1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        preparer.setup(&flow(2, 7, 2)).await.unwrap();

        assert!(!cache_dir.join("7.1").exists());
        assert!(cache_dir.join("7.2").exists());
    }

    #[tokio::test]
    async fn concurrent_setups_fetch_in_parallel_and_install_once() {
        let data = TempDir::new().unwrap();
        let archives = Arc::new(FakeArchiveStore::slow(20));
        let cache_dir = data.path().join("projects");
        let preparer = Arc::new(
            FlowPreparer::new(
                archives.clone(),
                cache_dir.clone(),
                data.path().join("executions"),
                0,
            )
            .unwrap(),
        );

        let (first, second) = tokio::join!(
            {
                let p = preparer.clone();
                async move { p.setup(&flow(1, 7, 3)).await.unwrap() }
            },
            {
                let p = preparer.clone();
                async move { p.setup(&flow(2, 7, 3)).await.unwrap() }
            },
        );

        // neither fetch waited on the other, and the loser of the install
        // race reused the winner's copy
        assert_eq!(archives.fetches.load(Ordering::SeqCst), 2);
        assert!(cache_dir.join("7.3").is_dir());
        assert!(first.join("job.properties").is_file());
        assert!(second.join("job.properties").is_file());
    }
}
