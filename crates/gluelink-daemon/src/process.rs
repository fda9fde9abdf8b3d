//! Liveness checks and termination of recorded tunnel processes.
//!
//! The keeper is not necessarily our child: the supervisor that launched it
//! has usually exited. Everything here therefore works on raw pids and
//! process groups rather than `Child` handles.

use std::future::Future;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use gluelink_core::TunnelRecord;
use nix::unistd::Pid;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from signalling a process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid pid: {pid}")]
    InvalidPid { pid: u32 },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// Process table operations the supervisor and reconnect daemon rely on.
pub trait ProcessControl: Send + Sync {
    /// Whether `pid` refers to a running (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Kernel start time of `pid`, if the platform exposes it.
    fn start_time(&self, pid: u32) -> Option<u64>;

    /// Whether the keeper named by `record` is still the process at its pid.
    ///
    /// A pid that is alive but started at a different time belongs to some
    /// other process and does not count. Records without a start time fall
    /// back to plain liveness.
    fn is_running(&self, record: &TunnelRecord) -> bool {
        if !self.is_alive(record.pid) {
            return false;
        }
        match record.start_time {
            Some(expected) => self.start_time(record.pid) == Some(expected),
            None => true,
        }
    }

    /// Stop `pid` and its process group: SIGTERM, then SIGKILL after `timeout`.
    /// Succeeds if the process is already gone.
    fn terminate(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ProcessError>> + Send;
}

/// [`ProcessControl`] over the real process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

fn to_pid(pid: u32) -> Result<Pid, ProcessError> {
    i32::try_from(pid)
        .ok()
        .filter(|&raw| raw > 0)
        .map(Pid::from_raw)
        .ok_or(ProcessError::InvalidPid { pid })
}

impl SystemProcesses {
    /// Send `signal` to the process group led by `pid`, falling back to the
    /// single process when it does not lead a group.
    fn signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let target = to_pid(pid)?;
        match killpg(target, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => match kill(target, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(source) => Err(ProcessError::Signal { pid, source }),
            },
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    /// SIGKILL the whole process group led by `pid`. Succeeds if it is gone.
    pub fn kill_group(pid: u32) -> Result<(), ProcessError> {
        Self::signal(pid, Signal::SIGKILL)
    }

    async fn wait_gone(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        // Reap it if it is our own exited child (the periodic runner's keepers).
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => {}
            Ok(status) => {
                debug!(pid, ?status, "Reaped exited child");
                return false;
            }
        }
        match kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        proc_start_time(pid)
    }

    async fn terminate(&self, pid: u32, timeout: Duration) -> Result<(), ProcessError> {
        if !self.is_alive(pid) {
            debug!(pid, "Process already gone");
            return Ok(());
        }

        Self::signal(pid, Signal::SIGTERM)?;
        if self.wait_gone(pid, timeout).await {
            info!(pid, "Process exited after SIGTERM");
            return Ok(());
        }

        warn!(pid, "Timeout waiting for graceful shutdown, killing");
        Self::signal(pid, Signal::SIGKILL)?;
        if !self.wait_gone(pid, timeout).await {
            warn!(pid, "Process still present after SIGKILL");
        }
        Ok(())
    }
}

/// Fields of `/proc/<pid>/stat` after the command name, starting at state.
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    // "pid (comm) S ..." where comm may contain ')'.
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    stat_fields(pid).is_some_and(|fields| fields.first().is_some_and(|state| state == "Z"))
}

/// Field 22 of `/proc/<pid>/stat`: start time in clock ticks after boot.
#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<u64> {
    stat_fields(pid)?.get(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
const fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
const fn proc_start_time(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use super::*;

    fn spawn_group_leader(script: &str) -> u32 {
        let child = Command::new("sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap();
        child.id()
    }

    #[test]
    fn invalid_pids_are_not_alive() {
        let procs = SystemProcesses;
        assert!(!procs.is_alive(0));
        assert!(!procs.is_alive(u32::MAX));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(SystemProcesses.is_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reused_pid_is_not_the_recorded_keeper() {
        let procs = SystemProcesses;
        let pid = spawn_group_leader("sleep 30");
        let actual = procs.start_time(pid).unwrap();

        let keeper = TunnelRecord::new(pid, "10.0.3.7", 8998, 8998).with_start_time(Some(actual));
        assert!(procs.is_running(&keeper));

        // Same pid, but the recorded keeper started at another time.
        let stale = keeper.clone().with_start_time(Some(actual.wrapping_add(1)));
        assert!(procs.is_alive(pid));
        assert!(!procs.is_running(&stale));

        procs.terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!procs.is_running(&keeper));
    }

    #[tokio::test]
    async fn terminate_stops_group_with_sigterm() {
        let procs = SystemProcesses;
        let pid = spawn_group_leader("sleep 30");
        assert!(procs.is_alive(pid));

        procs.terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!procs.is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let procs = SystemProcesses;
        let pid = spawn_group_leader("trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install the trap.
        sleep(Duration::from_millis(200)).await;

        procs
            .terminate(pid, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!procs.is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_of_dead_process_is_ok() {
        let procs = SystemProcesses;
        let pid = spawn_group_leader("exit 0");
        sleep(Duration::from_millis(200)).await;
        assert!(!procs.is_alive(pid));
        procs.terminate(pid, Duration::from_secs(1)).await.unwrap();
    }
}
