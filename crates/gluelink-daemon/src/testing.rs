//! In-memory fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::probe::{Probe, ProbeError};
use crate::process::{ProcessControl, ProcessError};
use crate::tunnel::{LaunchError, TunnelLauncher};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process table where only explicitly spawned pids are alive.
#[derive(Debug, Default)]
pub struct FakeProcesses {
    /// Live pids and their start times.
    alive: Mutex<HashMap<u32, u64>>,
    clock: AtomicU64,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    /// Start `pid`. Spawning a pid again models pid reuse: the new process
    /// gets a later start time.
    pub fn spawn(&self, pid: u32) {
        let started = self.clock.fetch_add(1, Ordering::SeqCst) + 100;
        lock(&self.alive).insert(pid, started);
    }

    pub fn kill(&self, pid: u32) {
        lock(&self.alive).remove(&pid);
    }

    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.terminated).clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.alive).contains_key(&pid)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        lock(&self.alive).get(&pid).copied()
    }

    async fn terminate(&self, pid: u32, _timeout: Duration) -> Result<(), ProcessError> {
        lock(&self.terminated).push(pid);
        self.kill(pid);
        Ok(())
    }
}

/// Launcher that "spawns" sequential pids into a [`FakeProcesses`].
#[derive(Debug)]
pub struct FakeLauncher {
    procs: Arc<FakeProcesses>,
    next_pid: AtomicU32,
    launched: Mutex<Vec<String>>,
    /// Every keeper pid ever started, launched or stray.
    keepers: Mutex<Vec<u32>>,
    fail: AtomicBool,
    die_on_launch: AtomicBool,
}

impl FakeLauncher {
    pub fn new(procs: Arc<FakeProcesses>) -> Self {
        Self {
            procs,
            next_pid: AtomicU32::new(1000),
            launched: Mutex::new(Vec::new()),
            keepers: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            die_on_launch: AtomicBool::new(false),
        }
    }

    /// Make every launch fail with a missing key.
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Launched processes exit immediately.
    pub fn die_on_launch(&self) {
        self.die_on_launch.store(true, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<String> {
        lock(&self.launched).clone()
    }

    /// A keeper that runs without being recorded anywhere.
    pub fn stray(&self, pid: u32) {
        self.procs.spawn(pid);
        lock(&self.keepers).push(pid);
    }
}

impl TunnelLauncher for FakeLauncher {
    fn launch(&self, host: &str) -> Result<u32, LaunchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LaunchError::MissingKey {
                path: "/missing/glue_key".into(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        lock(&self.launched).push(host.to_string());
        lock(&self.keepers).push(pid);
        if !self.die_on_launch.load(Ordering::SeqCst) {
            self.procs.spawn(pid);
        }
        Ok(pid)
    }

    fn running_keeper(&self) -> Result<Option<u32>, LaunchError> {
        Ok(lock(&self.keepers)
            .iter()
            .copied()
            .find(|&pid| self.procs.is_alive(pid)))
    }
}

/// Probe whose result is toggled by the test.
#[derive(Debug)]
pub struct FakeProbe {
    reachable: AtomicBool,
    checks: AtomicU32,
}

impl FakeProbe {
    pub const fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            checks: AtomicU32::new(0),
        }
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

impl Probe for FakeProbe {
    fn target(&self) -> String {
        "fake://tunnel".into()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Unreachable {
                target: self.target(),
                reason: "connection refused".into(),
            })
        }
    }
}
