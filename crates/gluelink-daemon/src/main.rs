//! gluelink
//!
//! Keeps the SSH tunnel between a notebook host and its development endpoint
//! alive. Each subcommand is one short-lived invocation meant to be run from
//! cron (or from `gluelink run`), except `tunnel`, which is the long-lived
//! keeper started by `supervise`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use gluelink_core::tracing_init::{RAW_LOG_BACKUPS, RAW_LOG_MAX_BYTES, cap_log_file};
use gluelink_core::{Config, DaemonVariant, StateStore};
use gluelink_daemon::context::TUNNEL_LOG;
use gluelink_daemon::runner::{PeriodicRunner, RunnerSettings};
use gluelink_daemon::schedule::{ScheduleSpec, cron_log, install_crontab};
use gluelink_daemon::{DaemonContext, Invocation};

#[derive(Parser, Debug)]
#[command(name = "gluelink")]
#[command(version, about = "gluelink - keeps the notebook to dev endpoint SSH tunnel alive")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "GLUELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "GLUELINK_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "GLUELINK_LOG_JSON")]
    log_json: bool,

    /// Local forwarded port (overrides config and environment).
    #[arg(long, global = true)]
    local_port: Option<u16>,

    /// Remote port on the endpoint (overrides config and environment).
    #[arg(long, global = true)]
    remote_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel if it is not running (or runs to a stale endpoint).
    Supervise,
    /// Probe the tunnel end to end and tear it down if unreachable.
    Reconnect,
    /// One-time host preparation; a no-op once the ready marker exists.
    Bootstrap,
    /// Run the forwarding session in the foreground (started by `supervise`).
    Tunnel {
        /// Endpoint host; defaults to the host file.
        #[arg(long)]
        host: Option<String>,
    },
    /// Wait until the tunnel answers the probe.
    WaitReady {
        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Run bootstrap, supervise and reconnect on timers until interrupted.
    Run,
    /// Stop the running tunnel.
    Stop,
    /// Print (or install) the crontab block and the on-start script.
    Schedule {
        /// Merge the block into the current user's crontab.
        #[arg(long)]
        install: bool,
        /// Binary path used in the entries; defaults to this executable.
        #[arg(long)]
        binary: Option<PathBuf>,
        /// Print the on-start script instead of the crontab block.
        #[arg(long, conflicts_with = "install")]
        lifecycle_script: bool,
    },
    /// Show bootstrap and tunnel state.
    Status,
}

impl Command {
    /// Raw output file cron or the on-start hook redirects this command to.
    fn cron_log(&self, config: &Config) -> Option<PathBuf> {
        let name = match self {
            Self::Supervise => "supervise",
            Self::Reconnect => "reconnect",
            Self::Bootstrap => "bootstrap",
            Self::WaitReady { .. } => "wait-ready",
            Self::Tunnel { .. }
            | Self::Run
            | Self::Stop
            | Self::Schedule { .. }
            | Self::Status => return None,
        };
        Some(cron_log(&config.paths.log_dir, name))
    }

    /// Rotated tracing log for this command, if it has one.
    fn log_file(&self, config: &Config) -> Option<PathBuf> {
        let name = match self {
            Self::Supervise | Self::Stop => DaemonVariant::Supervisor.as_str(),
            Self::Reconnect => DaemonVariant::Reconnect.as_str(),
            Self::Bootstrap => DaemonVariant::Bootstrap.as_str(),
            Self::Run => "run",
            // The launcher already sends keeper output to its own file.
            Self::Tunnel { .. }
            | Self::WaitReady { .. }
            | Self::Schedule { .. }
            | Self::Status => return None,
        };
        Some(config.paths.log_dir.join(format!("{name}.log")))
    }
}

const WAIT_READY_HINT: &str = "\
The tunnel did not come up. To find out why:
  1. Check that the development endpoint exists and is READY.
  2. Check that the endpoint holds the public key matching the private key.
  3. Check that the host file names the endpoint's current address.
  4. Check the gluelink logs in the configured log directory.
The notebook can still be started without the on-start script.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = gluelink_core::config::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.local_port {
        config.tunnel.local_port = port;
    }
    if let Some(port) = cli.remote_port {
        config.tunnel.remote_port = port;
    }
    config.validate()?;

    let log_filter = format!("gluelink={}", cli.log_level);
    let log_file = cli.command.log_file(&config);
    let _log_guard =
        gluelink_core::tracing_init::init_tracing(&log_filter, cli.log_json, log_file.as_deref());
    if let Some(path) = cli.command.cron_log(&config)
        && let Err(e) = cap_log_file(&path, RAW_LOG_MAX_BYTES, RAW_LOG_BACKUPS)
    {
        warn!(path = %path.display(), error = %e, "Failed to rotate cron log");
    }

    let ctx = DaemonContext::new(config, cli.config.as_deref())?;
    let result = dispatch(cli.command, &ctx, cli.config).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "gluelink failed");
    }
    result
}

#[allow(clippy::print_stdout, clippy::print_stderr, clippy::too_many_lines)]
async fn dispatch(
    command: Command,
    ctx: &DaemonContext,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    match command {
        Command::Supervise => {
            if let Invocation::Completed(outcome) = ctx.supervise().await? {
                info!(?outcome, "Supervisor finished");
            }
        }
        Command::Reconnect => {
            if let Invocation::Completed(outcome) = ctx.reconnect().await? {
                info!(?outcome, "Connectivity check finished");
            }
        }
        Command::Bootstrap => {
            if let Invocation::Completed(outcome) = ctx.bootstrap().await? {
                info!(?outcome, "Bootstrap finished");
            }
        }
        Command::Stop => {
            if let Invocation::Completed(stopped) = ctx.stop().await? {
                info!(pid = ?stopped, "Stop finished");
            }
        }
        Command::Tunnel { host } => {
            let host = match host {
                Some(host) => host,
                None => ctx.store().read_host()?,
            };
            // Held until the keeper exits; the supervisor finds keepers by it.
            let _keeper_lock = ctx.keeper_lock()?;
            let keeper = ctx.keeper(&host);
            info!(
                version = env!("CARGO_PKG_VERSION"),
                host = %host,
                forward = %keeper.spec().forward(),
                "Starting tunnel keeper"
            );
            keeper.run(shutdown_channel()?).await?;
        }
        Command::WaitReady { timeout_secs } => {
            let limit = Duration::from_secs(
                timeout_secs.unwrap_or(ctx.config().probe.wait_timeout_secs),
            );
            if let Err(e) = ctx.wait_ready(limit).await {
                eprintln!("{WAIT_READY_HINT}");
                return Err(e.into());
            }
        }
        Command::Run => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting periodic runner");
            let mut runner = PeriodicRunner::new(RunnerSettings::from_config(ctx.config()));
            runner.run(ctx, shutdown_channel()?).await?;
        }
        Command::Schedule {
            install,
            binary,
            lifecycle_script,
        } => {
            let binary = match binary {
                Some(binary) => binary,
                None => std::env::current_exe().context("Cannot locate the gluelink executable")?,
            };
            let spec = ScheduleSpec {
                binary,
                config: config_path,
                log_dir: ctx.config().paths.log_dir.clone(),
            };
            if lifecycle_script {
                print!("{}", spec.lifecycle_script());
            } else if install {
                let timeout = Duration::from_secs(ctx.config().daemon.invocation_timeout_secs);
                let changed = install_crontab(&spec.crontab_block(), timeout).await?;
                info!(changed, "Crontab checked");
            } else {
                print!("{}", spec.crontab_block());
            }
        }
        Command::Status => {
            let status = ctx.status()?;
            println!("ready:   {}", status.ready);
            println!("host:    {}", status.host.as_deref().unwrap_or("-"));
            match status.tunnel {
                Some(record) => println!(
                    "tunnel:  pid {} -> {} ({}:{}) {}, up {}s",
                    record.pid,
                    record.host,
                    record.local_port,
                    record.remote_port,
                    if status.alive { "running" } else { "dead" },
                    record.age().as_secs()
                ),
                None => println!("tunnel:  none"),
            }
            println!(
                "logs:    {}",
                ctx.config().paths.log_dir.join(TUNNEL_LOG).display()
            );
        }
    }
    Ok(())
}

/// Shutdown flag flipped by Ctrl+C or SIGTERM.
fn shutdown_channel() -> anyhow::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm.recv() => info!("Received SIGTERM shutdown signal"),
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}
