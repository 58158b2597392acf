//! Bounded cache of unpacked project directories.
//!
//! Installed projects live under the cache directory as
//! `<projectId>.<version>`. Each carries a size sentinel file whose
//! content is the directory's byte size and whose mtime doubles as the
//! last-access stamp. When installing a new project would push the
//! cache over its limit, the least recently used directories go first.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Sentinel file inside every cached project directory.
pub(crate) const PROJECT_DIR_SIZE_FILE: &str = "__dir_size__";

#[derive(Debug)]
pub(crate) struct ProjectDirectoryMetadata {
    pub project_id: i32,
    pub version: i32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed: SystemTime,
}

pub(crate) struct ProjectCacheCleaner {
    cache_dir: PathBuf,
    max_size_bytes: u64,
}

impl ProjectCacheCleaner {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size_bytes,
        }
    }

    /// Evict least recently used projects until the incoming install
    /// fits under the cache limit.
    pub fn delete_if_necessary(&self, incoming_size: u64) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let mut entries = self.scan()?;
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total + incoming_size <= self.max_size_bytes {
            return Ok(());
        }
        entries.sort_by_key(|e| e.last_accessed);
        for entry in entries {
            if total + incoming_size <= self.max_size_bytes {
                break;
            }
            match std::fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    total = total.saturating_sub(entry.size_bytes);
                    tracing::info!(
                        project_id = entry.project_id,
                        version = entry.version,
                        size_bytes = entry.size_bytes,
                        "evicted cached project"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %entry.path.display(),
                        error = %e,
                        "could not evict cached project"
                    );
                }
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ProjectDirectoryMetadata>> {
        let mut entries = Vec::new();
        let dir = std::fs::read_dir(&self.cache_dir)
            .with_context(|| format!("reading cache dir {}", self.cache_dir.display()))?;
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some((project_id, version)) = parse_project_dir_name(&name.to_string_lossy())
            else {
                continue;
            };
            let Some((size_bytes, last_accessed)) = read_sentinel(&entry.path()) else {
                // Half-installed or foreign directory; leave it alone.
                continue;
            };
            entries.push(ProjectDirectoryMetadata {
                project_id,
                version,
                path: entry.path(),
                size_bytes,
                last_accessed,
            });
        }
        Ok(entries)
    }
}

pub(crate) fn project_dir_name(project_id: i32, version: i32) -> String {
    format!("{project_id}.{version}")
}

fn parse_project_dir_name(name: &str) -> Option<(i32, i32)> {
    let (p, v) = name.split_once('.')?;
    Some((p.parse().ok()?, v.parse().ok()?))
}

/// Write or refresh the sentinel, stamping last access.
pub(crate) fn write_sentinel(project_dir: &Path, size_bytes: u64) -> Result<()> {
    let path = project_dir.join(PROJECT_DIR_SIZE_FILE);
    std::fs::write(&path, size_bytes.to_string())
        .with_context(|| format!("writing size sentinel {}", path.display()))
}

fn read_sentinel(project_dir: &Path) -> Option<(u64, SystemTime)> {
    let path = project_dir.join(PROJECT_DIR_SIZE_FILE);
    let size = std::fs::read_to_string(&path).ok()?.trim().parse().ok()?;
    let accessed = std::fs::metadata(&path).ok()?.modified().ok()?;
    Some((size, accessed))
}
