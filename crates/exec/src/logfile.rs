//! Execution log files.
//!
//! Every execution directory carries one flow log and one log per job
//! attempt. File names are stable so logs can be located by execution
//! id alone:
//!
//! - `_flow.<execId>.<flowId>.log`
//! - `_job.<execId>.<jobId>.log` (first attempt)
//! - `_job.<execId>.<attempt>.<jobId>.log` (later attempts)
//! - `_job.<execId>.<attempt?>.<jobId>.meta` (terminal metadata)

use anyhow::{Context, Result};
use chrono::Utc;
use flowdeck_core::{ExecutableNode, JobLogger};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Nested id separator is not filesystem-safe; logs flatten it.
fn printable_id(nested_id: &str) -> String {
    nested_id.replace(':', "._.")
}

pub fn flow_log_name(execution_id: i64, flow_id: &str) -> String {
    format!("_flow.{execution_id}.{flow_id}.log")
}

pub fn job_log_name(execution_id: i64, nested_id: &str, attempt: u32) -> String {
    let id = printable_id(nested_id);
    if attempt > 0 {
        format!("_job.{execution_id}.{attempt}.{id}.log")
    } else {
        format!("_job.{execution_id}.{id}.log")
    }
}

pub fn job_meta_name(execution_id: i64, nested_id: &str, attempt: u32) -> String {
    let id = printable_id(nested_id);
    if attempt > 0 {
        format!("_job.{execution_id}.{attempt}.{id}.meta")
    } else {
        format!("_job.{execution_id}.{id}.meta")
    }
}

/// Append-only log file with timestamped lines. Writes are best-effort;
/// a full disk must not take the execution down with it.
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, msg: &str) {
        let stamped = format!("{} {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), msg);
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_all(stamped.as_bytes()) {
                tracing::warn!(path = %self.path.display(), error = %e, "log write failed");
            }
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).with_context(|| format!("reading {}", self.path.display()))
    }
}

impl JobLogger for FileLog {
    fn line(&self, msg: &str) {
        FileLog::line(self, msg)
    }
}

/// Write the terminal metadata sidecar for a job attempt.
pub fn write_job_meta(dir: &Path, execution_id: i64, node: &ExecutableNode) -> Result<PathBuf> {
    let path = dir.join(job_meta_name(execution_id, &node.nested_id, node.attempt));
    let meta = serde_json::json!({
        "executionId": execution_id,
        "nestedId": node.nested_id,
        "attempt": node.attempt,
        "status": node.status,
        "startTime": node.start_time,
        "endTime": node.end_time,
        "failureMessage": node.failure_message,
        "killedBySla": node.killed_by_sla,
    });
    let data = serde_json::to_vec_pretty(&meta).context("encoding job metadata")?;
    std::fs::write(&path, data)
        .with_context(|| format!("writing job metadata {}", path.display()))?;
    Ok(path)
}

/// Read up to `length` bytes starting at `offset`. Returns the chunk
/// and the number of bytes actually read.
pub fn read_chunk(path: &Path, offset: u64, length: usize) -> Result<(Vec<u8>, usize)> {
    let mut file =
        File::open(path).with_context(|| format!("opening log file {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seeking to {offset} in {}", path.display()))?;
    let mut buf = vec![0u8; length];
    let mut read = 0;
    loop {
        let n = file
            .read(&mut buf[read..])
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        read += n;
        if read == length {
            break;
        }
    }
    buf.truncate(read);
    Ok((buf, read))
}
