// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Ping files
//!
//! Small filesystem markers conveying liveness: a `task.queued` file while
//! a batch submission is pending, a `task.executing` file whose mtime is
//! advanced as a heartbeat while child processes run, and a
//! `task.queued.bad` file kept behind after a failed submission. Ping
//! files are advisory exclusion markers, not locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::errors::{StepflowError, StepflowResult};

/// Interval at which the executing heartbeat advances the mtime.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Age after which an executing ping counts as stale (2× heartbeat).
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Contents of a queued ping file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedPing {
    pub submit_time: DateTime<Utc>,
    pub cluster_job_id: String,
    pub user: String,
    pub host: String,
    pub config_id: String,
}

/// Contents of an executing ping file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutingPing {
    pub start_time: DateTime<Utc>,
    pub host: String,
    pub pid: u32,
    pub cores_requested: u32,
}

/// Ping file paths for one run, under `<run dir>/.ping/`.
#[derive(Debug, Clone)]
pub struct PingFiles {
    dir: PathBuf,
}

impl PingFiles {
    pub fn new(run_output_dir: &Path) -> Self {
        Self {
            dir: run_output_dir.join(".ping"),
        }
    }

    pub fn queued_path(&self) -> PathBuf {
        self.dir.join("task.queued")
    }

    pub fn executing_path(&self) -> PathBuf {
        self.dir.join("task.executing")
    }

    pub fn queued_bad_path(&self) -> PathBuf {
        self.dir.join("task.queued.bad")
    }

    pub fn write_queued(&self, ping: &QueuedPing) -> StepflowResult<()> {
        self.write(&self.queued_path(), ping)
    }

    pub fn write_executing(&self, ping: &ExecutingPing) -> StepflowResult<()> {
        self.write(&self.executing_path(), ping)
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) -> StepflowResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| StepflowError::write_error(&self.dir, e))?;
        let yaml = serde_yaml::to_string(value)?;
        std::fs::write(path, yaml).map_err(|e| StepflowError::write_error(path, e))
    }

    /// Read the queued ping; a file that exists but cannot be parsed is an
    /// error, a missing file is `None`.
    pub fn read_queued(&self) -> StepflowResult<Option<QueuedPing>> {
        read_ping(&self.queued_path())
    }

    pub fn read_executing(&self) -> StepflowResult<Option<ExecutingPing>> {
        read_ping(&self.executing_path())
    }

    pub fn read_queued_bad(&self) -> StepflowResult<Option<QueuedPing>> {
        read_ping(&self.queued_bad_path())
    }

    /// Rename the queued ping to `.queued.bad` after a failed submission.
    /// The bad file is never deleted automatically.
    pub fn mark_queued_bad(&self) -> StepflowResult<()> {
        std::fs::rename(self.queued_path(), self.queued_bad_path())
            .map_err(|e| StepflowError::write_error(&self.queued_bad_path(), e))
    }

    pub fn remove_queued(&self) -> StepflowResult<()> {
        remove_if_exists(&self.queued_path())
    }

    pub fn remove_executing(&self) -> StepflowResult<()> {
        remove_if_exists(&self.executing_path())
    }

    /// Advance the executing heartbeat.
    pub fn touch_executing(&self) -> StepflowResult<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.executing_path())
            .map_err(|e| StepflowError::write_error(&self.executing_path(), e))?;
        file.set_modified(SystemTime::now())
            .map_err(|e| StepflowError::write_error(&self.executing_path(), e))?;
        Ok(())
    }

    /// Age of the executing heartbeat, when the ping exists.
    pub fn executing_age(&self) -> Option<Duration> {
        let meta = std::fs::metadata(self.executing_path()).ok()?;
        let mtime = meta.modified().ok()?;
        SystemTime::now().duration_since(mtime).ok()
    }

    /// Executing ping present but heartbeat older than the threshold.
    pub fn is_stale(&self) -> bool {
        matches!(self.executing_age(), Some(age) if age > STALE_AFTER)
    }
}

fn read_ping<T: for<'de> Deserialize<'de>>(path: &Path) -> StepflowResult<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StepflowError::PingUnreadable {
                path: path.to_path_buf(),
                error: e.to_string(),
            })
        }
    };
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| StepflowError::PingUnreadable {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
}

fn remove_if_exists(path: &Path) -> StepflowResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StepflowError::write_error(path, e)),
    }
}

/// Host name for ping files.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".to_string()
    }
}

/// User name for ping files.
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
