//! Process supervision seam.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

/// A command to start as a supervised job process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the supervisor's own.
    pub env: Vec<(String, String)>,
    /// Locked by the child for as long as it lives.
    pub lock_path: PathBuf,
    /// Receives stdout and stderr.
    pub log_path: PathBuf,
    /// CPU seconds allowed on top of what the child already used.
    pub cpu_limit: Option<u64>,
}

impl ProcessSpec {
    pub fn new(command: Vec<String>, lock_path: PathBuf, log_path: PathBuf) -> Self {
        Self {
            command,
            cwd: None,
            env: Vec::new(),
            lock_path,
            log_path,
            cpu_limit: None,
        }
    }

    pub fn cpu_limit(mut self, seconds: u64) -> Self {
        self.cpu_limit = Some(seconds);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Spawns, observes and terminates job processes without blocking on them.
pub trait Supervisor: Send + Sync {
    /// Start the process in its own session; returns its pid (also its group id).
    fn spawn(&self, spec: &ProcessSpec) -> Result<i32>;

    /// Whether a live process still holds the lock file.
    fn is_locked(&self, lock_path: &Path) -> Result<bool>;

    /// Pid the live holder of the lock file recorded in it, if any.
    fn lock_holder(&self, lock_path: &Path) -> Result<Option<i32>>;

    /// Kill the whole process group. A group that is already gone is not an error.
    fn kill_group(&self, pid: i32) -> Result<()>;

    /// Collect exited children without blocking; returns how many were reaped.
    fn reap(&self) -> usize;
}
