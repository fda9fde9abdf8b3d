//! Long-lived keeper that owns the ssh child.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Instant;

use gluelink_core::ReconnectPolicy;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::ssh::SshTunnelSpec;

/// Errors that end a keeper or one of its ssh sessions.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error("Failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for ssh: {0}")]
    Wait(#[source] std::io::Error),

    #[error("ssh session ended: {0}")]
    SessionEnded(ExitStatus),

    #[error("Giving up after {attempts} reconnect attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Runs ssh sessions back to back with bounded backoff.
pub struct TunnelKeeper {
    spec: SshTunnelSpec,
    policy: ReconnectPolicy,
}

impl TunnelKeeper {
    pub const fn new(spec: SshTunnelSpec, policy: ReconnectPolicy) -> Self {
        Self { spec, policy }
    }

    pub const fn spec(&self) -> &SshTunnelSpec {
        &self.spec
    }

    /// Keep the forward up until shutdown or until the backoff is exhausted.
    ///
    /// Returns `Ok(())` only on shutdown. Exhaustion is an error so the
    /// process exits non-zero and the next supervisor cycle takes over.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), KeeperError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Tunnel keeper shutting down");
                return Ok(());
            }

            let started = Instant::now();
            let err = match self.run_session(&mut shutdown).await {
                Ok(()) => {
                    info!("Tunnel keeper shutting down");
                    return Ok(());
                }
                Err(e) => e,
            };

            // A session that held long enough earns a fresh backoff.
            if started.elapsed() >= self.policy.stable_after {
                attempt = 0;
            }

            if !self.policy.should_retry(attempt) {
                error!(error = %err, attempt, host = %self.spec.host, "Max reconnect attempts reached");
                return Err(KeeperError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                error = %err,
                attempt,
                delay_ms = delay.as_millis(),
                host = %self.spec.host,
                "Restarting ssh session"
            );

            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Tunnel keeper shutting down during reconnect wait");
                    return Ok(());
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }

    /// Run one ssh session until it exits or shutdown is signalled.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), KeeperError> {
        let mut child = self
            .spec
            .command()
            .spawn()
            .map_err(|source| KeeperError::Spawn {
                binary: self.spec.ssh_binary.clone(),
                source,
            })?;

        info!(
            pid = child.id(),
            host = %self.spec.host,
            forward = %self.spec.forward(),
            "ssh session started"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(KeeperError::Wait)?;
                Err(KeeperError::SessionEnded(status))
            }
            _ = shutdown.changed() => {
                info!("Stopping ssh session");
                child.kill().await.ok();
                Ok(())
            }
        }
    }
}
