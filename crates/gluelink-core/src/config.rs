//! Configuration resolution for gluelink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults (the notebook layout the bootstrap scripts expect)
//! 2. TOML config file (`--config`, else `~/.config/gluelink/config.toml`)
//! 3. Environment variables (`GLUELINK_*`)
//! 4. CLI arguments (applied by the binary, highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::ReconnectPolicy;
use crate::error::{Error, Result};

const GLUE_HOME: &str = "/home/ec2-user/glue";

/// Complete gluelink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

/// SSH forwarding parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    pub local_port: u16,
    pub remote_port: u16,
    /// Address the endpoint side forwards to (as seen from the endpoint).
    pub remote_bind_host: String,
    pub user: String,
    pub private_key: PathBuf,
    pub ssh_binary: PathBuf,
    pub server_alive_interval_secs: u64,
    pub server_alive_count_max: u32,
    pub connect_timeout_secs: u64,
    /// Extra `-o` options, e.g. `UserKnownHostsFile=/dev/null`. They are passed
    /// before the built-in options; ssh keeps the first value it sees, so an
    /// extra option overrides the built-in default for the same keyword.
    pub extra_options: Vec<String>,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: f64,
    /// `None` keeps retrying forever inside one keeper process.
    pub backoff_max_attempts: Option<u32>,
    pub backoff_stable_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            local_port: 8998,
            remote_port: 8998,
            remote_bind_host: "localhost".to_string(),
            user: "glue".to_string(),
            private_key: PathBuf::from(GLUE_HOME).join("ssh").join("glue_key"),
            ssh_binary: PathBuf::from("ssh"),
            server_alive_interval_secs: 30,
            server_alive_count_max: 3,
            connect_timeout_secs: 10,
            extra_options: Vec::new(),
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            backoff_multiplier: 2.0,
            backoff_max_attempts: Some(10),
            backoff_stable_secs: 60,
        }
    }
}

impl TunnelSettings {
    /// Backoff policy the tunnel keeper applies between ssh sessions.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(self.backoff_initial_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            multiplier: self.backoff_multiplier,
            max_attempts: self.backoff_max_attempts,
            stable_after: Duration::from_secs(self.backoff_stable_secs),
        }
    }
}

/// Locations of the files the daemons coordinate through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathSettings {
    /// Resolved endpoint address, written at bootstrap.
    pub host_file: PathBuf,
    /// Presence means bootstrap completed.
    pub ready_marker: PathBuf,
    /// JSON record of the running tunnel keeper.
    pub tunnel_state: PathBuf,
    pub lock_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        let home = PathBuf::from(GLUE_HOME);
        Self {
            host_file: home.join("autossh.host"),
            ready_marker: home.join(".gluelink-ready"),
            tunnel_state: home.join("tunnel.json"),
            lock_dir: home.join("locks"),
            log_dir: home.join("logs"),
        }
    }
}

/// How reachability through the tunnel is checked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Any HTTP response from the forwarded port counts as reachable.
    #[default]
    Http,
    /// A successful TCP connect counts as reachable.
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeSettings {
    pub kind: ProbeKind,
    /// Request path for HTTP probes.
    pub path: String,
    pub timeout_secs: u64,
    /// Poll interval for `wait-ready`.
    pub wait_interval_secs: u64,
    /// Give up `wait-ready` after this long (region setup can be slow).
    pub wait_timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Http,
            path: "/".to_string(),
            timeout_secs: 10,
            wait_interval_secs: 5,
            wait_timeout_secs: 30 * 60,
        }
    }
}

/// Scheduling and timeout settings shared by the daemon variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonSettings {
    pub supervise_interval_secs: u64,
    pub reconnect_interval_secs: u64,
    /// A tunnel younger than this is not probed.
    pub startup_grace_secs: u64,
    /// SIGTERM to SIGKILL escalation window.
    pub terminate_timeout_secs: u64,
    /// Hard bound on one supervise/reconnect/stop invocation.
    pub invocation_timeout_secs: u64,
    /// How long a freshly launched keeper must survive to count as started.
    pub launch_check_millis: u64,
    /// The periodic runner gives up after failing continuously this long.
    pub max_failure_hours: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            supervise_interval_secs: 60,
            reconnect_interval_secs: 60,
            startup_grace_secs: 10,
            terminate_timeout_secs: 5,
            invocation_timeout_secs: 50,
            launch_check_millis: 500,
            max_failure_hours: 48,
        }
    }
}

impl DaemonSettings {
    /// Number of consecutive failed supervise ticks tolerated by the runner.
    pub fn max_consecutive_failures(&self) -> u64 {
        (self.max_failure_hours.saturating_mul(3600) / self.supervise_interval_secs.max(1)).max(1)
    }
}

/// One-time setup performed before the daemons are first enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Shell commands run in order (asset download, dependency install).
    pub commands: Vec<String>,
    /// Literal endpoint address to write to the host file.
    pub host: Option<String>,
    /// Shell command whose trimmed stdout is the endpoint address.
    pub host_command: Option<String>,
    /// Generate the private key with `ssh-keygen` when it is missing.
    pub generate_key: bool,
    pub key_comment: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            host: None,
            host_command: None,
            generate_key: false,
            key_comment: None,
            command_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Validate the configuration. Returns an error on invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.local_port == 0 || self.tunnel.remote_port == 0 {
            return Err(Error::Config("tunnel ports must be non-zero".into()));
        }
        if self.tunnel.user.is_empty() {
            return Err(Error::Config("tunnel.user must not be empty".into()));
        }
        if self.tunnel.remote_bind_host.is_empty() {
            return Err(Error::Config(
                "tunnel.remote_bind_host must not be empty".into(),
            ));
        }
        let multiplier = self.tunnel.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::Config(format!(
                "tunnel.backoff_multiplier must be a finite value >= 1.0 (got {multiplier})"
            )));
        }
        if self.daemon.supervise_interval_secs == 0 || self.daemon.reconnect_interval_secs == 0 {
            return Err(Error::Config("daemon intervals must be non-zero".into()));
        }
        if self.daemon.invocation_timeout_secs == 0 || self.probe.timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if !self.probe.path.starts_with('/') {
            return Err(Error::Config(format!(
                "probe.path must start with '/' (got {:?})",
                self.probe.path
            )));
        }
        if self.bootstrap.host.is_some() && self.bootstrap.host_command.is_some() {
            return Err(Error::Config(
                "bootstrap.host and bootstrap.host_command are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global path is only used when present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gluelink").join("config.toml"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `GLUELINK_*` overrides, looking variables up through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("GLUELINK_LOCAL_PORT")
        && let Ok(port) = val.parse()
    {
        config.tunnel.local_port = port;
    }
    if let Some(val) = lookup("GLUELINK_REMOTE_PORT")
        && let Ok(port) = val.parse()
    {
        config.tunnel.remote_port = port;
    }
    if let Some(val) = lookup("GLUELINK_SSH_USER") {
        config.tunnel.user = val;
    }
    if let Some(val) = lookup("GLUELINK_PRIVATE_KEY") {
        config.tunnel.private_key = PathBuf::from(val);
    }
    if let Some(val) = lookup("GLUELINK_HOST_FILE") {
        config.paths.host_file = PathBuf::from(val);
    }
    if let Some(val) = lookup("GLUELINK_LOCK_DIR") {
        config.paths.lock_dir = PathBuf::from(val);
    }
    if let Some(val) = lookup("GLUELINK_LOG_DIR") {
        config.paths.log_dir = PathBuf::from(val);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_notebook_layout() {
        let config = Config::default();
        assert_eq!(config.tunnel.local_port, 8998);
        assert_eq!(config.tunnel.remote_port, 8998);
        assert_eq!(config.tunnel.user, "glue");
        assert_eq!(
            config.paths.host_file,
            PathBuf::from("/home/ec2-user/glue/autossh.host")
        );
        assert_eq!(config.probe.wait_timeout_secs, 1800);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tunnel]
local_port = 18998
user = "livy"

[probe]
kind = "tcp"

[bootstrap]
commands = ["aws s3 cp s3://bucket/assets /tmp/assets --recursive"]
host = "10.0.0.12"
"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.tunnel.local_port, 18998);
        assert_eq!(config.tunnel.remote_port, 8998);
        assert_eq!(config.tunnel.user, "livy");
        assert_eq!(config.probe.kind, ProbeKind::Tcp);
        assert_eq!(config.probe.timeout_secs, 10);
        assert_eq!(config.bootstrap.commands.len(), 1);
        assert_eq!(config.bootstrap.host.as_deref(), Some("10.0.0.12"));
        assert_eq!(config.daemon, DaemonSettings::default());
    }

    #[test]
    fn unreadable_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tunnel\nlocal_port = ").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "GLUELINK_LOCAL_PORT" => Some("9000".into()),
            "GLUELINK_REMOTE_PORT" => Some("not-a-port".into()),
            "GLUELINK_HOST_FILE" => Some("/tmp/host".into()),
            _ => None,
        });
        assert_eq!(config.tunnel.local_port, 9000);
        assert_eq!(config.tunnel.remote_port, 8998);
        assert_eq!(config.paths.host_file, PathBuf::from("/tmp/host"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.tunnel.local_port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bootstrap.host = Some("a".into());
        config.bootstrap.host_command = Some("echo b".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.path = "health".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite_multiplier() {
        for multiplier in [f64::NAN, f64::INFINITY, 0.5] {
            let mut config = Config::default();
            config.tunnel.backoff_multiplier = multiplier;
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "multiplier {multiplier} accepted"
            );
        }
    }

    #[test]
    fn failure_cap_follows_interval() {
        let settings = DaemonSettings::default();
        assert_eq!(settings.max_consecutive_failures(), 48 * 60);

        let settings = DaemonSettings {
            supervise_interval_secs: 30,
            ..DaemonSettings::default()
        };
        assert_eq!(settings.max_consecutive_failures(), 48 * 120);
    }

    #[test]
    fn failure_cap_saturates_on_huge_window() {
        let settings = DaemonSettings {
            max_failure_hours: u64::MAX,
            ..DaemonSettings::default()
        };
        assert_eq!(settings.max_consecutive_failures(), u64::MAX / 60);
    }

    #[test]
    fn reconnect_policy_from_settings() {
        let policy = TunnelSettings::default().reconnect_policy();
        assert_eq!(policy, ReconnectPolicy::default());
    }
}
