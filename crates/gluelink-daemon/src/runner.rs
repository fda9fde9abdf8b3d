//! In-process scheduler: the `run` command's alternative to cron.

use std::future::Future;
use std::time::Duration;

use gluelink_core::Config;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::context::{DaemonContext, DaemonError};
use crate::invocation::Invocation;

/// The periodic work, one call per tick.
pub trait RunnerTasks: Send + Sync {
    /// Bootstrap if the ready marker is missing.
    fn ensure_ready(&self) -> impl Future<Output = Result<(), DaemonError>> + Send;
    fn supervise_once(&self) -> impl Future<Output = Result<(), DaemonError>> + Send;
    fn check_connectivity(&self) -> impl Future<Output = Result<(), DaemonError>> + Send;
}

impl RunnerTasks for DaemonContext {
    async fn ensure_ready(&self) -> Result<(), DaemonError> {
        DaemonContext::ensure_ready(self).await
    }

    async fn supervise_once(&self) -> Result<(), DaemonError> {
        if let Invocation::Completed(outcome) = self.supervise().await? {
            info!(?outcome, "Supervisor cycle finished");
        }
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), DaemonError> {
        if let Invocation::Completed(outcome) = self.reconnect().await? {
            info!(?outcome, "Connectivity check finished");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Giving up after {failures} consecutive failures: {last}")]
    TooManyFailures { failures: u64, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub supervise_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_consecutive_failures: u64,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supervise_interval: Duration::from_secs(config.daemon.supervise_interval_secs),
            reconnect_interval: Duration::from_secs(config.daemon.reconnect_interval_secs),
            max_consecutive_failures: config.daemon.max_consecutive_failures(),
        }
    }
}

pub struct PeriodicRunner {
    settings: RunnerSettings,
    failures: u64,
}

impl PeriodicRunner {
    pub const fn new(settings: RunnerSettings) -> Self {
        Self {
            settings,
            failures: 0,
        }
    }

    /// Tick until shutdown or until failures pile up past the cap.
    pub async fn run<T: RunnerTasks>(
        &mut self,
        tasks: &T,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RunnerError> {
        let mut supervise_tick = interval(self.settings.supervise_interval);
        supervise_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect_tick = interval(self.settings.reconnect_interval);
        reconnect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            supervise_secs = self.settings.supervise_interval.as_secs(),
            reconnect_secs = self.settings.reconnect_interval.as_secs(),
            max_failures = self.settings.max_consecutive_failures,
            "Periodic runner started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = supervise_tick.tick() => {
                    let result = match tasks.ensure_ready().await {
                        Ok(()) => tasks.supervise_once().await,
                        Err(e) => Err(e),
                    };
                    self.record("supervise", result)?;
                }
                _ = reconnect_tick.tick() => {
                    let result = tasks.check_connectivity().await;
                    self.record("reconnect", result)?;
                }
            }
        }

        info!("Periodic runner stopped");
        Ok(())
    }

    fn record(&mut self, task: &str, result: Result<(), DaemonError>) -> Result<(), RunnerError> {
        match result {
            Ok(()) => {
                if self.failures > 0 {
                    info!(task, after = self.failures, "Recovered");
                }
                self.failures = 0;
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= self.settings.max_consecutive_failures {
                    error!(task, error = %e, failures = self.failures, "Too many consecutive failures");
                    return Err(RunnerError::TooManyFailures {
                        failures: self.failures,
                        last: e.to_string(),
                    });
                }
                warn!(task, error = %e, failures = self.failures, "Periodic task failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingTasks {
        ready: AtomicU32,
        supervised: AtomicU32,
        reconnected: AtomicU32,
        fail_supervise: AtomicBool,
    }

    impl RunnerTasks for CountingTasks {
        async fn ensure_ready(&self) -> Result<(), DaemonError> {
            self.ready.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn supervise_once(&self) -> Result<(), DaemonError> {
            self.supervised.fetch_add(1, Ordering::SeqCst);
            if self.fail_supervise.load(Ordering::SeqCst) {
                return Err(DaemonError::State(gluelink_core::Error::State(
                    "host file missing".into(),
                )));
            }
            Ok(())
        }

        async fn check_connectivity(&self) -> Result<(), DaemonError> {
            self.reconnected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const FAST: RunnerSettings = RunnerSettings {
        supervise_interval: Duration::from_millis(10),
        reconnect_interval: Duration::from_millis(25),
        max_consecutive_failures: 3,
    };

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let tasks = CountingTasks::default();
        let (tx, rx) = watch::channel(false);
        let mut runner = PeriodicRunner::new(FAST);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(runner.run(&tasks, rx), stop);
        result.unwrap();

        let supervised = tasks.supervised.load(Ordering::SeqCst);
        assert!(supervised >= 3);
        assert_eq!(tasks.ready.load(Ordering::SeqCst), supervised);
        assert!(tasks.reconnected.load(Ordering::SeqCst) >= 2);
        assert!(tasks.reconnected.load(Ordering::SeqCst) < supervised);
    }

    #[tokio::test]
    async fn stops_after_consecutive_failures() {
        let tasks = CountingTasks::default();
        tasks.fail_supervise.store(true, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);
        let mut runner = PeriodicRunner::new(RunnerSettings {
            reconnect_interval: Duration::from_secs(3600),
            ..FAST
        });

        let err = tokio::time::timeout(Duration::from_secs(5), runner.run(&tasks, rx))
            .await
            .unwrap()
            .unwrap_err();
        let RunnerError::TooManyFailures { failures, last } = err;
        assert_eq!(failures, 3);
        assert!(last.contains("host file missing"));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let mut runner = PeriodicRunner::new(FAST);
        let failure = || Err(DaemonError::State(gluelink_core::Error::State("x".into())));
        runner.record("supervise", failure()).unwrap();
        runner.record("supervise", failure()).unwrap();
        runner.record("reconnect", Ok(())).unwrap();
        runner.record("supervise", failure()).unwrap();
        runner.record("supervise", failure()).unwrap();
        assert!(runner.record("supervise", failure()).is_err());
    }
}
