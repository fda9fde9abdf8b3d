//! Starting a detached tunnel keeper.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use gluelink_core::tracing_init::{RAW_LOG_BACKUPS, RAW_LOG_MAX_BYTES, cap_log_file};
use gluelink_core::{DaemonLock, DaemonVariant};
use tracing::{info, warn};

/// Errors from launching a keeper.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Private key not found at {}", path.display())]
    MissingKey { path: PathBuf },

    #[error("Failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot inspect the keeper lock: {0}")]
    KeeperLock(#[source] gluelink_core::Error),
}

/// Starts a forwarding process for a host and returns its pid.
pub trait TunnelLauncher: Send + Sync {
    fn launch(&self, host: &str) -> Result<u32, LaunchError>;

    /// Pid of a keeper that is running right now, recorded or not.
    fn running_keeper(&self) -> Result<Option<u32>, LaunchError>;
}

/// Launches `<program> [--config <path>] tunnel --host <host>` in its own
/// process group so it outlives the supervisor and can be stopped as a group.
#[derive(Debug, Clone)]
pub struct KeeperLauncher {
    program: PathBuf,
    global_args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    private_key: PathBuf,
    log_file: Option<PathBuf>,
    log_max_bytes: u64,
    lock_dir: Option<PathBuf>,
}

impl KeeperLauncher {
    pub fn new(program: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
            envs: Vec::new(),
            private_key: private_key.into(),
            log_file: None,
            log_max_bytes: RAW_LOG_MAX_BYTES,
            lock_dir: None,
        }
    }

    /// Pass the config file through so the keeper resolves the same settings.
    #[must_use]
    pub fn with_config_path(mut self, path: &Path) -> Self {
        self.global_args.push("--config".into());
        self.global_args.push(path.as_os_str().to_owned());
        self
    }

    /// Set an environment variable for the keeper.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Append keeper and ssh output to `path` instead of discarding it.
    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Rotate the log file once it reaches `bytes`.
    #[must_use]
    pub fn with_log_limit(mut self, bytes: u64) -> Self {
        self.log_max_bytes = bytes;
        self
    }

    /// Directory where keepers take their [`DaemonVariant::Tunnel`] lock.
    #[must_use]
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    fn output(&self) -> Result<(Stdio, Stdio), LaunchError> {
        let Some(path) = &self.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        match cap_log_file(path, self.log_max_bytes, RAW_LOG_BACKUPS) {
            Ok(true) => info!(path = %path.display(), "Rotated keeper log"),
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to rotate keeper log"),
        }
        let open = || -> std::io::Result<_> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let clone = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(clone)))
        };
        open().map_err(|source| LaunchError::LogFile {
            path: path.clone(),
            source,
        })
    }
}

impl TunnelLauncher for KeeperLauncher {
    fn launch(&self, host: &str) -> Result<u32, LaunchError> {
        if !self.private_key.is_file() {
            return Err(LaunchError::MissingKey {
                path: self.private_key.clone(),
            });
        }

        let (stdout, stderr) = self.output()?;
        let child = Command::new(&self.program)
            .args(&self.global_args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .arg("tunnel")
            .arg("--host")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(pid, host, program = %self.program.display(), "Launched tunnel keeper");
        // Dropping the handle neither waits for nor kills the keeper.
        drop(child);
        Ok(pid)
    }

    fn running_keeper(&self) -> Result<Option<u32>, LaunchError> {
        let Some(dir) = &self.lock_dir else {
            return Ok(None);
        };
        DaemonLock::holder(dir, DaemonVariant::Tunnel).map_err(LaunchError::KeeperLock)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use super::*;
    use crate::process::{ProcessControl, SystemProcesses};

    fn fake_keeper(dir: &Path) -> PathBuf {
        let path = dir.join("fake-gluelink");
        std::fs::write(
            &path,
            "#!/bin/sh\necho \"args: $*\"\necho \"port: $GLUELINK_LOCAL_PORT\"\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn missing_key_is_reported_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = KeeperLauncher::new(fake_keeper(dir.path()), dir.path().join("no-key"));
        let err = launcher.launch("10.0.3.7").unwrap_err();
        assert!(matches!(err, LaunchError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn launches_detached_group_leader_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("glue_key");
        std::fs::write(&key, "key").unwrap();
        let config = dir.path().join("config.toml");
        let log = dir.path().join("logs").join("tunnel.log");

        let launcher = KeeperLauncher::new(fake_keeper(dir.path()), &key)
            .with_config_path(&config)
            .with_env("GLUELINK_LOCAL_PORT", "9000")
            .with_log_file(&log);
        let pid = launcher.launch("10.0.3.7").unwrap();

        let procs = SystemProcesses;
        assert!(procs.is_alive(pid));
        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(
            i32::try_from(pid).unwrap(),
        )))
        .unwrap();
        assert_eq!(pgid.as_raw(), i32::try_from(pid).unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains(&format!(
            "args: --config {} tunnel --host 10.0.3.7",
            config.display()
        )));
        assert!(logged.contains("port: 9000"));

        procs.terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!procs.is_alive(pid));
    }

    #[tokio::test]
    async fn oversized_log_is_rotated_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("glue_key");
        std::fs::write(&key, "key").unwrap();
        let log = dir.path().join("tunnel.log");
        std::fs::write(&log, "x".repeat(64)).unwrap();

        let launcher = KeeperLauncher::new(fake_keeper(dir.path()), &key)
            .with_log_file(&log)
            .with_log_limit(32);
        let pid = launcher.launch("10.0.3.7").unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("tunnel.log.1")).unwrap(),
            "x".repeat(64)
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(std::fs::read_to_string(&log).unwrap().starts_with("args: "));

        SystemProcesses
            .terminate(pid, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[test]
    fn running_keeper_is_read_from_its_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = dir.path().join("locks");
        let launcher = KeeperLauncher::new("/bin/false", dir.path().join("glue_key"));
        assert_eq!(launcher.running_keeper().unwrap(), None);

        let launcher = launcher.with_lock_dir(&locks);
        assert_eq!(launcher.running_keeper().unwrap(), None);

        let _keeper = DaemonLock::try_acquire(&locks, DaemonVariant::Tunnel)
            .unwrap()
            .unwrap();
        assert_eq!(launcher.running_keeper().unwrap(), Some(std::process::id()));
    }
}
