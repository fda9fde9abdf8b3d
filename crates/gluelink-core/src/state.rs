//! File-backed daemon state.
//!
//! The daemons are separate short-lived processes, so everything that has to
//! survive between invocations lives in small files: the resolved endpoint
//! host, the bootstrap ready marker and the record of the running tunnel.
//! Access goes through [`StateStore`] so supervision logic can be exercised
//! without touching the filesystem.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PathSettings;
use crate::error::{Error, Result};

/// The running forwarding session, as recorded by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    /// Keeper process id; also its process group id.
    pub pid: u32,
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Seconds since the Unix epoch.
    pub started_at: u64,
    /// Kernel start time of the keeper process, in clock ticks since boot.
    /// Tells the keeper apart from a later process that reuses its pid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl TunnelRecord {
    pub fn new(pid: u32, host: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            pid,
            host: host.to_string(),
            local_port,
            remote_port,
            started_at: unix_now(),
            start_time: None,
        }
    }

    #[must_use]
    pub fn with_start_time(mut self, start_time: Option<u64>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Whether this session forwards to the given endpoint and ports.
    pub fn targets(&self, host: &str, local_port: u16, remote_port: u16) -> bool {
        self.host == host && self.local_port == local_port && self.remote_port == remote_port
    }

    /// Time since the session was started; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.started_at))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Persistence interface for host file, ready marker and tunnel record.
pub trait StateStore: Send + Sync {
    /// Read the endpoint host. Missing or blank files are errors.
    fn read_host(&self) -> Result<String>;
    fn write_host(&self, host: &str) -> Result<()>;

    fn is_ready(&self) -> bool;
    /// Record that bootstrap completed. A no-op if already recorded.
    fn mark_ready(&self) -> Result<()>;

    fn load_tunnel(&self) -> Result<Option<TunnelRecord>>;
    fn save_tunnel(&self, record: &TunnelRecord) -> Result<()>;
    fn clear_tunnel(&self) -> Result<()>;
}

/// [`StateStore`] backed by the files named in [`PathSettings`].
#[derive(Debug, Clone)]
pub struct FsStateStore {
    host_file: PathBuf,
    ready_marker: PathBuf,
    tunnel_state: PathBuf,
}

impl FsStateStore {
    pub fn new(paths: &PathSettings) -> Self {
        Self {
            host_file: paths.host_file.clone(),
            ready_marker: paths.ready_marker.clone(),
            tunnel_state: paths.tunnel_state.clone(),
        }
    }

    pub fn host_file(&self) -> &Path {
        &self.host_file
    }
}

impl StateStore for FsStateStore {
    fn read_host(&self) -> Result<String> {
        let content = fs::read_to_string(&self.host_file).map_err(|e| {
            Error::State(format!(
                "Failed to read host file {}: {e}",
                self.host_file.display()
            ))
        })?;
        let host = content.trim();
        if host.is_empty() {
            return Err(Error::State(format!(
                "host file {} is empty",
                self.host_file.display()
            )));
        }
        Ok(host.to_string())
    }

    fn write_host(&self, host: &str) -> Result<()> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::State("refusing to write an empty host".into()));
        }
        write_atomic(&self.host_file, host.as_bytes())
    }

    fn is_ready(&self) -> bool {
        self.ready_marker.exists()
    }

    fn mark_ready(&self) -> Result<()> {
        ensure_parent(&self.ready_marker)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.ready_marker)
        {
            Ok(mut file) => {
                writeln!(file, "{}", unix_now())?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_tunnel(&self) -> Result<Option<TunnelRecord>> {
        let content = match fs::read_to_string(&self.tunnel_state) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    path = %self.tunnel_state.display(),
                    error = %e,
                    "Discarding unreadable tunnel record"
                );
                Ok(None)
            }
        }
    }

    fn save_tunnel(&self, record: &TunnelRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.tunnel_state, &json)
    }

    fn clear_tunnel(&self) -> Result<()> {
        match fs::remove_file(&self.tunnel_state) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write via a sibling temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStateStore;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use super::{Error, Result, StateStore, TunnelRecord};

    #[derive(Debug, Default)]
    struct Inner {
        host: Option<String>,
        ready: bool,
        tunnel: Option<TunnelRecord>,
        fail_saves: bool,
    }

    /// In-memory [`StateStore`] for tests.
    #[derive(Debug, Default)]
    pub struct MemoryStateStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStateStore {
        pub fn with_host(host: &str) -> Self {
            let store = Self::default();
            store.lock().host = Some(host.to_string());
            store
        }

        /// Make every later `save_tunnel` fail.
        pub fn fail_saves(&self) {
            self.lock().fail_saves = true;
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl StateStore for MemoryStateStore {
        fn read_host(&self) -> Result<String> {
            self.lock()
                .host
                .clone()
                .ok_or_else(|| Error::State("host not set".into()))
        }

        fn write_host(&self, host: &str) -> Result<()> {
            self.lock().host = Some(host.trim().to_string());
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.lock().ready
        }

        fn mark_ready(&self) -> Result<()> {
            self.lock().ready = true;
            Ok(())
        }

        fn load_tunnel(&self) -> Result<Option<TunnelRecord>> {
            Ok(self.lock().tunnel.clone())
        }

        fn save_tunnel(&self, record: &TunnelRecord) -> Result<()> {
            let mut inner = self.lock();
            if inner.fail_saves {
                return Err(Error::State("tunnel record is not writable".into()));
            }
            inner.tunnel = Some(record.clone());
            Ok(())
        }

        fn clear_tunnel(&self) -> Result<()> {
            self.lock().tunnel = None;
            Ok(())
        }
    }
}
