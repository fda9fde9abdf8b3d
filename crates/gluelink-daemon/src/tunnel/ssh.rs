//! ssh command line for a local port forward.

use std::path::PathBuf;
use std::process::Stdio;

use gluelink_core::config::TunnelSettings;
use tokio::process::Command;

/// Everything needed to run one `ssh -L` forwarding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTunnelSpec {
    pub ssh_binary: PathBuf,
    pub user: String,
    pub host: String,
    pub private_key: PathBuf,
    pub local_port: u16,
    pub remote_bind_host: String,
    pub remote_port: u16,
    pub server_alive_interval_secs: u64,
    pub server_alive_count_max: u32,
    pub connect_timeout_secs: u64,
    pub extra_options: Vec<String>,
}

impl SshTunnelSpec {
    pub fn from_settings(settings: &TunnelSettings, host: &str) -> Self {
        Self {
            ssh_binary: settings.ssh_binary.clone(),
            user: settings.user.clone(),
            host: host.to_string(),
            private_key: settings.private_key.clone(),
            local_port: settings.local_port,
            remote_bind_host: settings.remote_bind_host.clone(),
            remote_port: settings.remote_port,
            server_alive_interval_secs: settings.server_alive_interval_secs,
            server_alive_count_max: settings.server_alive_count_max,
            connect_timeout_secs: settings.connect_timeout_secs,
            extra_options: settings.extra_options.clone(),
        }
    }

    /// The `-L` forward specification.
    pub fn forward(&self) -> String {
        format!(
            "127.0.0.1:{}:{}:{}",
            self.local_port, self.remote_bind_host, self.remote_port
        )
    }

    /// Arguments passed to ssh, without the binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-N".to_string()];
        let options = [
            "ExitOnForwardFailure=yes".to_string(),
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("ServerAliveInterval={}", self.server_alive_interval_secs),
            format!("ServerAliveCountMax={}", self.server_alive_count_max),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        // ssh keeps the first value per keyword, so extras go first to win.
        for option in self.extra_options.iter().cloned().chain(options) {
            args.push("-o".to_string());
            args.push(option);
        }
        args.push("-i".to_string());
        args.push(self.private_key.display().to_string());
        args.push("-L".to_string());
        args.push(self.forward());
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    /// ssh command ready to spawn; killed if the handle is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}
