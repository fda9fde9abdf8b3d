//! Check-and-repair of the tunnel keeper.
//!
//! Each invocation makes sure exactly one keeper forwards to the host named
//! in the host file. A keeper pointed at another host or other ports is
//! replaced; a dead one is forgotten and a new one started. A keeper that
//! holds the keeper lock without a usable record is replaced as well.

use std::time::Duration;

use gluelink_core::config::Config;
use gluelink_core::{StateStore, TunnelRecord};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::process::{ProcessControl, ProcessError};
use crate::tunnel::{LaunchError, TunnelLauncher};

/// Errors from a supervisor invocation.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] gluelink_core::Error),

    #[error("Failed to launch tunnel keeper: {0}")]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Tunnel keeper {pid} exited right after launch")]
    ExitedEarly { pid: u32 },
}

/// What a supervisor invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    AlreadyRunning { pid: u32 },
    Started { pid: u32 },
    /// The recorded keeper targeted something else and was replaced.
    Restarted { old_pid: u32, pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub local_port: u16,
    pub remote_port: u16,
    pub terminate_timeout: Duration,
    /// How long a fresh keeper must survive before it is recorded.
    pub launch_check: Duration,
}

impl SupervisorSettings {
    pub const fn from_config(config: &Config) -> Self {
        Self {
            local_port: config.tunnel.local_port,
            remote_port: config.tunnel.remote_port,
            terminate_timeout: Duration::from_secs(config.daemon.terminate_timeout_secs),
            launch_check: Duration::from_millis(config.daemon.launch_check_millis),
        }
    }
}

pub struct Supervisor<'a, S, P, L> {
    store: &'a S,
    procs: &'a P,
    launcher: &'a L,
    settings: SupervisorSettings,
}

impl<'a, S, P, L> Supervisor<'a, S, P, L>
where
    S: StateStore,
    P: ProcessControl,
    L: TunnelLauncher,
{
    pub const fn new(
        store: &'a S,
        procs: &'a P,
        launcher: &'a L,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            procs,
            launcher,
            settings,
        }
    }

    /// Ensure a keeper for the current host is running.
    pub async fn ensure_tunnel(&self) -> Result<SupervisorOutcome, SupervisorError> {
        let host = self.store.read_host()?;
        let SupervisorSettings {
            local_port,
            remote_port,
            ..
        } = self.settings;

        let mut replaced = None;
        if let Some(record) = self.store.load_tunnel()? {
            if self.procs.is_running(&record) {
                if record.targets(&host, local_port, remote_port) {
                    info!(pid = record.pid, host = %host, "Tunnel already running");
                    return Ok(SupervisorOutcome::AlreadyRunning { pid: record.pid });
                }
                info!(
                    pid = record.pid,
                    old_host = %record.host,
                    new_host = %host,
                    "Tunnel targets a different endpoint, replacing"
                );
                self.procs
                    .terminate(record.pid, self.settings.terminate_timeout)
                    .await?;
                replaced = Some(record.pid);
            } else if self.procs.is_alive(record.pid) {
                warn!(
                    pid = record.pid,
                    host = %record.host,
                    "Recorded pid now belongs to another process, forgetting it"
                );
            } else {
                warn!(pid = record.pid, host = %record.host, "Recorded tunnel is gone");
            }
            self.store.clear_tunnel()?;
        }

        if let Some(pid) = self.launcher.running_keeper()? {
            warn!(pid, "Found a keeper without a usable record, replacing it");
            self.procs
                .terminate(pid, self.settings.terminate_timeout)
                .await?;
            replaced.get_or_insert(pid);
        }

        let pid = self.launcher.launch(&host).inspect_err(|e| {
            error!(error = %e, host = %host, "Failed to start tunnel");
        })?;

        if !self.settings.launch_check.is_zero() {
            sleep(self.settings.launch_check).await;
        }
        if !self.procs.is_alive(pid) {
            error!(pid, host = %host, "Tunnel keeper exited right after launch");
            return Err(SupervisorError::ExitedEarly { pid });
        }

        let record = TunnelRecord::new(pid, &host, local_port, remote_port)
            .with_start_time(self.procs.start_time(pid));
        if let Err(e) = self.store.save_tunnel(&record) {
            error!(pid, error = %e, "Cannot record the new tunnel, stopping it");
            self.procs
                .terminate(pid, self.settings.terminate_timeout)
                .await?;
            return Err(e.into());
        }
        info!(pid, host = %host, local_port, remote_port, "Tunnel started");

        Ok(match replaced {
            Some(old_pid) => SupervisorOutcome::Restarted { old_pid, pid },
            None => SupervisorOutcome::Started { pid },
        })
    }

    /// Terminate the recorded keeper, if any, and forget it.
    ///
    /// Returns the pid that was stopped.
    pub async fn stop(&self) -> Result<Option<u32>, SupervisorError> {
        let Some(record) = self.store.load_tunnel()? else {
            info!("No tunnel recorded");
            return Ok(None);
        };
        let was_alive = self.procs.is_running(&record);
        if was_alive {
            self.procs
                .terminate(record.pid, self.settings.terminate_timeout)
                .await?;
            info!(pid = record.pid, host = %record.host, "Tunnel stopped");
        }
        self.store.clear_tunnel()?;
        Ok(was_alive.then_some(record.pid))
    }
}
