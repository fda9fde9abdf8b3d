//! Connectivity daemon: tears down a tunnel that no longer forwards.
//!
//! A keeper can be alive while its forward is dead (half-open TCP, remote
//! listener gone). The probe goes through the forward; when it fails the
//! keeper is terminated so the next supervisor cycle starts a fresh one.

use std::time::Duration;

use gluelink_core::config::Config;
use gluelink_core::{StateStore, TunnelRecord};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::probe::{Probe, ProbeError};
use crate::process::{ProcessControl, ProcessError};

/// Errors from a reconnect invocation. Probe failures are not errors.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error(transparent)]
    State(#[from] gluelink_core::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// What a reconnect invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// No live tunnel recorded; starting one is the supervisor's job.
    NoTunnel,
    /// The tunnel is too young to judge.
    WarmingUp { pid: u32 },
    Healthy { pid: u32 },
    TornDown { pid: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub startup_grace: Duration,
    pub terminate_timeout: Duration,
    /// Upper bound on one probe, on top of the probe's own timeouts.
    pub probe_timeout: Duration,
}

impl ReconnectSettings {
    pub const fn from_config(config: &Config) -> Self {
        Self {
            startup_grace: Duration::from_secs(config.daemon.startup_grace_secs),
            terminate_timeout: Duration::from_secs(config.daemon.terminate_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe.timeout_secs.saturating_add(5)),
        }
    }
}

pub struct ConnectivityDaemon<'a, S, P, Pr> {
    store: &'a S,
    procs: &'a P,
    probe: &'a Pr,
    settings: ReconnectSettings,
}

impl<'a, S, P, Pr> ConnectivityDaemon<'a, S, P, Pr>
where
    S: StateStore,
    P: ProcessControl,
    Pr: Probe,
{
    pub const fn new(
        store: &'a S,
        procs: &'a P,
        probe: &'a Pr,
        settings: ReconnectSettings,
    ) -> Self {
        Self {
            store,
            procs,
            probe,
            settings,
        }
    }

    /// Probe the recorded tunnel and tear it down if unreachable.
    pub async fn check(&self) -> Result<ReconnectOutcome, ReconnectError> {
        let Some(record) = self.store.load_tunnel()? else {
            debug!("No tunnel recorded");
            return Ok(ReconnectOutcome::NoTunnel);
        };
        if !self.procs.is_running(&record) {
            info!(pid = record.pid, "Recorded tunnel is not running");
            return Ok(ReconnectOutcome::NoTunnel);
        }

        let age = record.age();
        if age < self.settings.startup_grace {
            info!(
                pid = record.pid,
                age_secs = age.as_secs(),
                "Tunnel just started, not probing yet"
            );
            return Ok(ReconnectOutcome::WarmingUp { pid: record.pid });
        }

        let result = match timeout(self.settings.probe_timeout, self.probe.check()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Unreachable {
                target: self.probe.target(),
                reason: format!(
                    "probe exceeded {}s",
                    self.settings.probe_timeout.as_secs()
                ),
            }),
        };

        match result {
            Ok(()) => {
                info!(pid = record.pid, target = %self.probe.target(), "Tunnel healthy");
                Ok(ReconnectOutcome::Healthy { pid: record.pid })
            }
            Err(e) => {
                warn!(
                    pid = record.pid,
                    host = %record.host,
                    error = %e,
                    "Tunnel unreachable, tearing down"
                );
                self.tear_down(&record).await?;
                Ok(ReconnectOutcome::TornDown {
                    pid: record.pid,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn tear_down(&self, record: &TunnelRecord) -> Result<(), ReconnectError> {
        self.procs
            .terminate(record.pid, self.settings.terminate_timeout)
            .await?;
        // The supervisor may have replaced the record meanwhile; keep its.
        if self
            .store
            .load_tunnel()?
            .is_some_and(|current| current.pid == record.pid)
        {
            self.store.clear_tunnel()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use gluelink_core::state::MemoryStateStore;

    use super::*;
    use crate::testing::{FakeProbe, FakeProcesses};

    const SETTINGS: ReconnectSettings = ReconnectSettings {
        startup_grace: Duration::from_secs(10),
        terminate_timeout: Duration::from_secs(1),
        probe_timeout: Duration::from_secs(1),
    };

    fn settled_record(pid: u32) -> TunnelRecord {
        let mut record = TunnelRecord::new(pid, "10.0.3.7", 8998, 8998);
        record.started_at -= 120;
        record
    }

    #[tokio::test]
    async fn nothing_to_do_without_tunnel() {
        let store = MemoryStateStore::default();
        let procs = FakeProcesses::default();
        let probe = FakeProbe::new(false);
        let daemon = ConnectivityDaemon::new(&store, &procs, &probe, SETTINGS);

        assert_eq!(daemon.check().await.unwrap(), ReconnectOutcome::NoTunnel);

        store.save_tunnel(&settled_record(7)).unwrap();
        assert_eq!(daemon.check().await.unwrap(), ReconnectOutcome::NoTunnel);
        assert_eq!(probe.checks(), 0);
        assert!(procs.terminated().is_empty());
    }

    #[tokio::test]
    async fn fresh_tunnel_is_not_probed() {
        let store = MemoryStateStore::default();
        let procs = FakeProcesses::default();
        let probe = FakeProbe::new(false);
        procs.spawn(7);
        store
            .save_tunnel(&TunnelRecord::new(7, "10.0.3.7", 8998, 8998))
            .unwrap();

        let daemon = ConnectivityDaemon::new(&store, &procs, &probe, SETTINGS);
        assert_eq!(
            daemon.check().await.unwrap(),
            ReconnectOutcome::WarmingUp { pid: 7 }
        );
        assert_eq!(probe.checks(), 0);
    }

    #[tokio::test]
    async fn reachable_tunnel_is_healthy() {
        let store = MemoryStateStore::default();
        let procs = FakeProcesses::default();
        let probe = FakeProbe::new(true);
        procs.spawn(7);
        store.save_tunnel(&settled_record(7)).unwrap();

        let daemon = ConnectivityDaemon::new(&store, &procs, &probe, SETTINGS);
        assert_eq!(
            daemon.check().await.unwrap(),
            ReconnectOutcome::Healthy { pid: 7 }
        );
        assert!(procs.is_alive(7));
        assert!(store.load_tunnel().unwrap().is_some());
    }

    #[tokio::test]
    async fn unreachable_tunnel_is_torn_down() {
        let store = MemoryStateStore::default();
        let procs = FakeProcesses::default();
        let probe = FakeProbe::new(false);
        procs.spawn(7);
        store.save_tunnel(&settled_record(7)).unwrap();

        let daemon = ConnectivityDaemon::new(&store, &procs, &probe, SETTINGS);
        let outcome = daemon.check().await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::TornDown { pid: 7, .. }));
        assert_eq!(procs.terminated(), vec![7]);
        assert!(!procs.is_alive(7));
        assert_eq!(store.load_tunnel().unwrap(), None);
    }

    #[tokio::test]
    async fn process_reusing_keeper_pid_is_never_signalled() {
        let store = MemoryStateStore::default();
        let procs = FakeProcesses::default();
        let probe = FakeProbe::new(false);
        procs.spawn(7);
        store
            .save_tunnel(&settled_record(7).with_start_time(procs.start_time(7)))
            .unwrap();
        procs.kill(7);
        procs.spawn(7);

        let daemon = ConnectivityDaemon::new(&store, &procs, &probe, SETTINGS);
        assert_eq!(daemon.check().await.unwrap(), ReconnectOutcome::NoTunnel);
        assert_eq!(probe.checks(), 0);
        assert!(procs.terminated().is_empty());
        assert!(procs.is_alive(7));
    }
}
