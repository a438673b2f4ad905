//! Local supervisor backed by POSIX sessions, rlimits and `flock`.

use shipyard_core::{Error, ProcessSpec, Result, Supervisor};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Supervisor of job processes started on this host.
///
/// Children are never waited on synchronously. [`Supervisor::reap`] collects
/// the ones that exited, and only those this supervisor started.
#[derive(Default)]
pub struct LocalSupervisor {
    children: Mutex<HashSet<i32>>,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of started children not reaped yet.
    pub fn tracked(&self) -> usize {
        self.children.lock().map(|c| c.len()).unwrap_or_default()
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if the file is
/// already locked by another process.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: fd is a valid descriptor owned by `file`.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

/// Decimal digits of `pid` at the end of `buf`, without allocating.
fn pid_digits(pid: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = pid.unsigned_abs();
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

/// Runs in the forked child before exec. Only async-signal-safe calls.
fn prepare_child(lock_fd: i32, cpu_limit: Option<u64>) -> io::Result<()> {
    // SAFETY: plain syscalls on the child's own session, descriptors and limits.
    unsafe {
        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }

        // The lock descriptor must survive exec so the lock lives as long as the job.
        if libc::fcntl(lock_fd, libc::F_SETFD, 0) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::flock(lock_fd, libc::LOCK_EX | libc::LOCK_NB) == -1 {
            return Err(io::Error::last_os_error());
        }

        // Record the group leader in the lock it holds.
        let mut buf = [0u8; 12];
        let digits = pid_digits(libc::getpid(), &mut buf);
        if libc::ftruncate(lock_fd, 0) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::pwrite(lock_fd, digits.as_ptr().cast(), digits.len(), 0) == -1 {
            return Err(io::Error::last_os_error());
        }

        if let Some(limit) = cpu_limit {
            let mut usage: libc::rusage = std::mem::zeroed();
            libc::getrusage(libc::RUSAGE_SELF, &mut usage);
            let used = (usage.ru_utime.tv_sec + usage.ru_stime.tv_sec).max(0) as libc::rlim_t;

            let mut rlimit: libc::rlimit = std::mem::zeroed();
            if libc::getrlimit(libc::RLIMIT_CPU, &mut rlimit) == -1 {
                return Err(io::Error::last_os_error());
            }
            let wanted = used.saturating_add(limit as libc::rlim_t);
            rlimit.rlim_cur = if rlimit.rlim_max == libc::RLIM_INFINITY {
                wanted
            } else {
                wanted.min(rlimit.rlim_max)
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

impl Supervisor for LocalSupervisor {
    fn spawn(&self, spec: &ProcessSpec) -> Result<i32> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty command".to_string()))?;

        let lock = open_lock_file(&spec.lock_path)?;
        let lock_fd = lock.as_raw_fd();

        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = File::create(&spec.log_path)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let cpu_limit = spec.cpu_limit;
        // SAFETY: the closure only performs async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || prepare_child(lock_fd, cpu_limit));
        }

        let child = cmd.spawn().map_err(|e| {
            warn!(command = ?spec.command, error = %e, "Failed to start job");
            Error::ExecutionFailed(format!("{}: {}", program, e))
        })?;
        drop(lock);

        let pid = i32::try_from(child.id())
            .map_err(|_| Error::Internal(format!("pid out of range: {}", child.id())))?;
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid);
        }
        // Dropping the handle neither waits nor kills; `reap` collects it.
        drop(child);

        info!(pid, command = ?spec.command, log = %spec.log_path.display(), "Job started");
        Ok(pid)
    }

    fn is_locked(&self, lock_path: &Path) -> Result<bool> {
        let file = open_lock_file(lock_path)?;
        // Dropping `file` releases a lock we managed to take.
        Ok(!try_flock_exclusive(&file)?)
    }

    fn lock_holder(&self, lock_path: &Path) -> Result<Option<i32>> {
        if !self.is_locked(lock_path)? {
            return Ok(None);
        }
        let content = std::fs::read_to_string(lock_path)?;
        Ok(content.trim().parse().ok().filter(|pid: &i32| *pid > 1))
    }

    fn kill_group(&self, pid: i32) -> Result<()> {
        if pid <= 1 {
            return Err(Error::InvalidInput(format!("refusing to kill group {}", pid)));
        }
        // SAFETY: killpg on an explicit, positive process group id.
        let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(pid, "Process group already gone");
                return Ok(());
            }
            return Err(err.into());
        }
        info!(pid, "Killed process group");
        Ok(())
    }

    fn reap(&self) -> usize {
        let Ok(mut children) = self.children.lock() else {
            return 0;
        };
        let mut reaped = 0;
        children.retain(|&pid| {
            let mut status = 0;
            // SAFETY: waitpid on a child pid we started, without blocking.
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            match rc {
                0 => true,
                -1 => {
                    // ECHILD: someone else collected it.
                    io::Error::last_os_error().raw_os_error() != Some(libc::ECHILD)
                }
                _ => {
                    debug!(pid, status, "Reaped job process");
                    reaped += 1;
                    false
                }
            }
        });
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn sh(script: &str, dir: &Path) -> ProcessSpec {
        ProcessSpec::new(
            vec!["/bin/sh".into(), "-c".into(), script.into()],
            dir.join("job.lock"),
            dir.join("logs/job.txt"),
        )
    }

    fn wait_unlocked(supervisor: &LocalSupervisor, lock: &PathBuf, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            supervisor.reap();
            if !supervisor.is_locked(lock).unwrap() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_output_goes_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let spec = sh("echo hello; echo oops >&2", dir.path()).env("GREETING", "hi");

        supervisor.spawn(&spec).unwrap();
        assert!(wait_unlocked(&supervisor, &spec.lock_path, Duration::from_secs(10)));

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn test_lock_held_while_running_and_kill() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let spec = sh("sleep 30 & sleep 30", dir.path());

        let pid = supervisor.spawn(&spec).unwrap();
        assert!(supervisor.is_locked(&spec.lock_path).unwrap());

        // A second job on the same lock cannot start.
        assert!(supervisor.spawn(&spec).is_err());

        supervisor.kill_group(pid).unwrap();
        assert!(wait_unlocked(&supervisor, &spec.lock_path, Duration::from_secs(10)));
        assert_eq!(supervisor.tracked(), 0);

        // Killing a group that is gone is fine.
        supervisor.kill_group(pid).unwrap();
    }

    #[test]
    fn test_lock_records_its_holder() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let spec = sh("sleep 30", dir.path());

        let pid = supervisor.spawn(&spec).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut holder = None;
        while holder.is_none() && Instant::now() < deadline {
            holder = supervisor.lock_holder(&spec.lock_path).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(holder, Some(pid));

        supervisor.kill_group(pid).unwrap();
        assert!(wait_unlocked(&supervisor, &spec.lock_path, Duration::from_secs(10)));
        assert_eq!(supervisor.lock_holder(&spec.lock_path).unwrap(), None);
    }

    #[test]
    fn test_pid_digits() {
        let mut buf = [0u8; 12];
        assert_eq!(pid_digits(0, &mut buf), b"0");
        assert_eq!(pid_digits(4_194_304, &mut buf), b"4194304");
        assert_eq!(pid_digits(i32::MAX, &mut buf), b"2147483647");
    }

    #[test]
    fn test_missing_lock_file_is_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        assert!(!supervisor.is_locked(&dir.path().join("nothing.lock")).unwrap());
    }

    #[test]
    fn test_cpu_limit_terminates_busy_job() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let spec = sh("while :; do :; done", dir.path()).cpu_limit(1);

        supervisor.spawn(&spec).unwrap();
        assert!(wait_unlocked(&supervisor, &spec.lock_path, Duration::from_secs(20)));
    }

    #[test]
    fn test_refuses_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        assert!(supervisor.kill_group(0).is_err());
        let empty = ProcessSpec::new(Vec::new(), dir.path().join("l"), dir.path().join("o"));
        assert!(supervisor.spawn(&empty).is_err());
    }
}
