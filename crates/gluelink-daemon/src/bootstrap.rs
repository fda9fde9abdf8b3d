//! One-time host preparation guarded by the ready marker.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gluelink_core::StateStore;
use gluelink_core::config::BootstrapSettings;
use tracing::{info, warn};

use crate::cmd::{CommandError, run_cmd, run_shell};

const DEFAULT_KEY_COMMENT: &str = "gluelink";

/// Errors that abort bootstrap. The ready marker stays unset.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    State(#[from] gluelink_core::Error),

    #[error("Failed to prepare {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Host command produced no output: {command}")]
    EmptyHost { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyReady,
    Completed { host: String },
}

pub struct Bootstrapper<'a, S> {
    store: &'a S,
    settings: &'a BootstrapSettings,
    private_key: &'a Path,
    keygen_program: String,
}

impl<'a, S: StateStore> Bootstrapper<'a, S> {
    pub fn new(store: &'a S, settings: &'a BootstrapSettings, private_key: &'a Path) -> Self {
        Self {
            store,
            settings,
            private_key,
            keygen_program: "ssh-keygen".into(),
        }
    }

    #[must_use]
    pub fn with_keygen_program(mut self, program: impl Into<String>) -> Self {
        self.keygen_program = program.into();
        self
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }

    /// Prepare the host unless the ready marker already exists.
    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        if self.store.is_ready() {
            info!("Already bootstrapped");
            return Ok(BootstrapOutcome::AlreadyReady);
        }
        info!(steps = self.settings.commands.len(), "Bootstrapping");

        for (i, command) in self.settings.commands.iter().enumerate() {
            let description = format!("Bootstrap step {}/{}", i + 1, self.settings.commands.len());
            run_shell(&description, command, self.command_timeout()).await?;
        }

        if self.settings.generate_key {
            self.ensure_key().await?;
        }

        let host = self.resolve_host().await?;
        self.store.mark_ready()?;
        info!(host = %host, "Bootstrap complete");
        Ok(BootstrapOutcome::Completed { host })
    }

    async fn ensure_key(&self) -> Result<(), BootstrapError> {
        let key = self.private_key;
        if key.exists() {
            info!(key = %key.display(), "SSH key already present");
            return Ok(());
        }
        if let Some(parent) = key.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BootstrapError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let key_arg = key.to_string_lossy();
        let comment = self
            .settings
            .key_comment
            .as_deref()
            .unwrap_or(DEFAULT_KEY_COMMENT);
        run_cmd(
            "Generating SSH key",
            &self.keygen_program,
            &[
                "-t", "rsa", "-b", "4096", "-N", "", "-C", comment, "-f", &key_arg,
            ],
            self.command_timeout(),
        )
        .await?;

        std::fs::set_permissions(key, std::fs::Permissions::from_mode(0o400)).map_err(
            |source| BootstrapError::Io {
                path: key.to_path_buf(),
                source,
            },
        )?;
        Ok(())
    }

    async fn resolve_host(&self) -> Result<String, BootstrapError> {
        if let Some(host) = self.settings.host.as_deref().map(str::trim)
            && !host.is_empty()
        {
            self.store.write_host(host)?;
            return Ok(host.to_string());
        }

        if let Some(command) = &self.settings.host_command {
            let output =
                run_shell("Resolving endpoint host", command, self.command_timeout()).await?;
            let host = output.lines().next().map(str::trim).unwrap_or_default();
            if host.is_empty() {
                return Err(BootstrapError::EmptyHost {
                    command: command.clone(),
                });
            }
            self.store.write_host(host)?;
            return Ok(host.to_string());
        }

        warn!("No host source configured, expecting an existing host file");
        Ok(self.store.read_host()?)
    }
}
