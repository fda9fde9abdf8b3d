//! Cron entries and the notebook on-start script.
//!
//! The managed crontab block is delimited by marker comments so installing
//! it again replaces the previous block instead of appending a duplicate.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::cmd::{CommandError, run_cmd};

pub const BEGIN_MARKER: &str = "# BEGIN gluelink";
pub const END_MARKER: &str = "# END gluelink";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Failed to write crontab: {0}")]
    Write(#[source] std::io::Error),

    #[error("crontab rejected the new table ({status}): {stderr}")]
    Rejected {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("crontab timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// File that cron appends the raw output of `command` to.
pub fn cron_log(log_dir: &Path, command: &str) -> PathBuf {
    log_dir.join(format!("cron-{command}.log"))
}

/// How scheduled invocations call the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub binary: PathBuf,
    pub config: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl ScheduleSpec {
    fn invocation(&self, command: &str) -> String {
        let mut line = shell_quote(&self.binary);
        if let Some(config) = &self.config {
            line.push_str(" --config ");
            line.push_str(&shell_quote(config));
        }
        line.push(' ');
        line.push_str(command);
        line
    }

    fn log_file(&self, command: &str) -> String {
        shell_quote(&cron_log(&self.log_dir, command))
    }

    /// The managed crontab block, markers included.
    pub fn crontab_block(&self) -> String {
        let mut block = String::new();
        block.push_str(BEGIN_MARKER);
        block.push('\n');
        for command in ["supervise", "reconnect"] {
            block.push_str(&format!(
                "* * * * * {} >> {} 2>&1\n",
                self.invocation(command),
                self.log_file(command)
            ));
        }
        block.push_str(END_MARKER);
        block.push('\n');
        block
    }

    /// Script for the notebook's on-start hook.
    ///
    /// The crontab goes in first: a failed bootstrap here does not stop the
    /// hook, since every scheduled `supervise` retries it until it succeeds.
    /// The wait runs in the background so the hook itself returns quickly.
    pub fn lifecycle_script(&self) -> String {
        format!(
            "#!/bin/bash\n\
             set -e\n\
             mkdir -p {log_dir}\n\
             {install}\n\
             {bootstrap} >> {bootstrap_log} 2>&1 || echo \"gluelink bootstrap failed, supervise retries it\" >&2\n\
             nohup {wait} >> {wait_log} 2>&1 &\n",
            log_dir = shell_quote(&self.log_dir),
            install = self.invocation("schedule --install"),
            bootstrap = self.invocation("bootstrap"),
            bootstrap_log = self.log_file("bootstrap"),
            wait = self.invocation("wait-ready"),
            wait_log = self.log_file("wait-ready"),
        )
    }
}

/// Replace the managed block in `current` with `block`, keeping other lines.
pub fn merge_crontab(current: &str, block: &str) -> String {
    let mut kept = Vec::new();
    let mut inside = false;
    for line in current.lines() {
        match line.trim() {
            l if l == BEGIN_MARKER => inside = true,
            l if l == END_MARKER => inside = false,
            _ if inside => {}
            _ => kept.push(line),
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }

    let mut merged = kept.join("\n");
    if !merged.is_empty() {
        merged.push('\n');
    }
    merged.push_str(block);
    merged
}

/// Install `block` into the current user's crontab.
///
/// Returns `false` when the crontab already contained exactly this block.
pub async fn install_crontab(block: &str, timeout: Duration) -> Result<bool, ScheduleError> {
    let current = match run_cmd("Reading crontab", "crontab", &["-l"], timeout).await {
        Ok(current) => current,
        // No crontab yet.
        Err(CommandError::Failed { .. }) => String::new(),
        Err(e) => return Err(e.into()),
    };

    let merged = merge_crontab(&current, block);
    if merged.trim_end() == current.trim_end() {
        info!("Crontab already up to date");
        return Ok(false);
    }

    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ScheduleError::Write)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(merged.as_bytes())
            .await
            .map_err(ScheduleError::Write)?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ScheduleError::TimedOut(timeout))?
        .map_err(ScheduleError::Write)?;
    if !output.status.success() {
        return Err(ScheduleError::Rejected {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    info!("Crontab installed");
    Ok(true)
}

/// Single-quote `path` for sh unless it is made of safe characters only.
fn shell_quote(path: &Path) -> String {
    let s = path.to_string_lossy();
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c))
    {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
