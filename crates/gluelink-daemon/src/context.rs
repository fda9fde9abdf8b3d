//! Wiring of the daemon variants to the real filesystem, process table and
//! network.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gluelink_core::{
    Config, DaemonLock, DaemonVariant, FsStateStore, LockGuard, StateStore, TunnelRecord,
};
use tokio::time::timeout;
use tracing::info;

use crate::bootstrap::{BootstrapError, BootstrapOutcome, Bootstrapper};
use crate::invocation::{Invocation, guarded};
use crate::probe::{ProbeError, TunnelProbe, wait_until_reachable};
use crate::process::{ProcessControl, SystemProcesses};
use crate::reconnect::{ConnectivityDaemon, ReconnectError, ReconnectOutcome, ReconnectSettings};
use crate::supervisor::{Supervisor, SupervisorError, SupervisorOutcome, SupervisorSettings};
use crate::tunnel::{KeeperLauncher, SshTunnelSpec, TunnelKeeper};

/// Log file the keeper's stdout and stderr are appended to.
pub const TUNNEL_LOG: &str = "tunnel.log";

/// Errors surfaced by a daemon invocation.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    State(#[from] gluelink_core::Error),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Cannot locate the gluelink executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Another tunnel keeper (pid {pid:?}) is already running")]
    KeeperRunning { pid: Option<u32> },

    #[error("{variant} invocation exceeded {}s", limit.as_secs())]
    TimedOut {
        variant: DaemonVariant,
        limit: Duration,
    },
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub ready: bool,
    pub host: Option<String>,
    pub tunnel: Option<TunnelRecord>,
    pub alive: bool,
}

/// Everything one gluelink process needs, built from the resolved [`Config`].
pub struct DaemonContext {
    config: Config,
    store: FsStateStore,
    procs: SystemProcesses,
    launcher: KeeperLauncher,
    probe: TunnelProbe,
}

impl DaemonContext {
    /// Context whose keepers are started from the running executable.
    pub fn new(config: Config, config_path: Option<&Path>) -> Result<Self, DaemonError> {
        let program = std::env::current_exe().map_err(DaemonError::CurrentExe)?;
        Self::with_keeper_program(config, program, config_path)
    }

    /// Context whose keepers are started as `<program> tunnel --host <host>`.
    pub fn with_keeper_program(
        config: Config,
        program: impl Into<PathBuf>,
        config_path: Option<&Path>,
    ) -> Result<Self, DaemonError> {
        // The keeper resolves its own config; pin what may have come from
        // flags so both ends agree.
        let mut launcher = KeeperLauncher::new(program, &config.tunnel.private_key)
            .with_env("GLUELINK_LOCAL_PORT", config.tunnel.local_port.to_string())
            .with_env("GLUELINK_REMOTE_PORT", config.tunnel.remote_port.to_string())
            .with_env("GLUELINK_SSH_USER", &config.tunnel.user)
            .with_env("GLUELINK_PRIVATE_KEY", &config.tunnel.private_key)
            .with_env("GLUELINK_HOST_FILE", &config.paths.host_file)
            .with_env("GLUELINK_LOCK_DIR", &config.paths.lock_dir)
            .with_log_file(config.paths.log_dir.join(TUNNEL_LOG))
            .with_lock_dir(&config.paths.lock_dir);
        if let Some(path) = config_path {
            launcher = launcher.with_config_path(path);
        }
        let probe = TunnelProbe::from_settings(&config.probe, config.tunnel.local_port)?;
        Ok(Self {
            store: FsStateStore::new(&config.paths),
            procs: SystemProcesses,
            launcher,
            probe,
            config,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn store(&self) -> &FsStateStore {
        &self.store
    }

    fn lock_dir(&self) -> &Path {
        &self.config.paths.lock_dir
    }

    fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.daemon.invocation_timeout_secs)
    }

    async fn bounded<T>(
        &self,
        variant: DaemonVariant,
        fut: impl Future<Output = Result<T, DaemonError>>,
    ) -> Result<T, DaemonError> {
        let limit = self.invocation_timeout();
        timeout(limit, fut)
            .await
            .map_err(|_| DaemonError::TimedOut { variant, limit })?
    }

    /// Run bootstrap unless the ready marker exists.
    ///
    /// A bootstrap skipped because another invocation holds its lock is not
    /// an error; the caller finds out on its own whether the host is usable.
    pub async fn ensure_ready(&self) -> Result<(), DaemonError> {
        if self.store.is_ready() {
            return Ok(());
        }
        info!("Bootstrap has not completed, running it first");
        self.bootstrap().await.map(drop)
    }

    /// One supervisor invocation, preceded by bootstrap while the host is
    /// not ready yet, so a failed bootstrap is retried every cycle.
    ///
    /// Bootstrap runs under the supervisor lock but outside the invocation
    /// timeout; its commands carry their own.
    pub async fn supervise(&self) -> Result<Invocation<SupervisorOutcome>, DaemonError> {
        let settings = SupervisorSettings::from_config(&self.config);
        guarded(self.lock_dir(), DaemonVariant::Supervisor, || async {
            self.ensure_ready().await?;
            self.bounded(DaemonVariant::Supervisor, async {
                Supervisor::new(&self.store, &self.procs, &self.launcher, settings)
                    .ensure_tunnel()
                    .await
                    .map_err(DaemonError::from)
            })
            .await
        })
        .await
    }

    /// One connectivity check.
    pub async fn reconnect(&self) -> Result<Invocation<ReconnectOutcome>, DaemonError> {
        let settings = ReconnectSettings::from_config(&self.config);
        self.bounded(
            DaemonVariant::Reconnect,
            guarded(self.lock_dir(), DaemonVariant::Reconnect, || async {
                ConnectivityDaemon::new(&self.store, &self.procs, &self.probe, settings)
                    .check()
                    .await
                    .map_err(DaemonError::from)
            }),
        )
        .await
    }

    /// Bootstrap unless already done. Bounded per command, not overall.
    pub async fn bootstrap(&self) -> Result<Invocation<BootstrapOutcome>, DaemonError> {
        guarded(self.lock_dir(), DaemonVariant::Bootstrap, || async {
            Bootstrapper::new(
                &self.store,
                &self.config.bootstrap,
                &self.config.tunnel.private_key,
            )
            .run()
            .await
            .map_err(DaemonError::from)
        })
        .await
    }

    /// Stop the recorded keeper. Shares the supervisor lock.
    pub async fn stop(&self) -> Result<Invocation<Option<u32>>, DaemonError> {
        let settings = SupervisorSettings::from_config(&self.config);
        self.bounded(
            DaemonVariant::Supervisor,
            guarded(self.lock_dir(), DaemonVariant::Supervisor, || async {
                Supervisor::new(&self.store, &self.procs, &self.launcher, settings)
                    .stop()
                    .await
                    .map_err(DaemonError::from)
            }),
        )
        .await
    }

    /// Block until the forward answers the probe or `limit` elapses.
    pub async fn wait_ready(&self, limit: Duration) -> Result<Duration, DaemonError> {
        let interval = Duration::from_secs(self.config.probe.wait_interval_secs);
        Ok(wait_until_reachable(&self.probe, interval, limit).await?)
    }

    pub fn status(&self) -> Result<TunnelStatus, DaemonError> {
        let tunnel = self.store.load_tunnel()?;
        Ok(TunnelStatus {
            ready: self.store.is_ready(),
            host: self.store.read_host().ok(),
            alive: tunnel
                .as_ref()
                .is_some_and(|record| self.procs.is_running(record)),
            tunnel,
        })
    }

    /// Take the keeper lock for the lifetime of a `tunnel` process.
    pub fn keeper_lock(&self) -> Result<LockGuard, DaemonError> {
        match DaemonLock::try_acquire(self.lock_dir(), DaemonVariant::Tunnel)? {
            Some(guard) => Ok(guard),
            None => Err(DaemonError::KeeperRunning {
                pid: DaemonLock::holder(self.lock_dir(), DaemonVariant::Tunnel)
                    .ok()
                    .flatten(),
            }),
        }
    }

    /// The keeper run by the `tunnel` command.
    pub fn keeper(&self, host: &str) -> TunnelKeeper {
        TunnelKeeper::new(
            SshTunnelSpec::from_settings(&self.config.tunnel, host),
            self.config.tunnel.reconnect_policy(),
        )
    }
}
