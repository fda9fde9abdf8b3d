//! Bounded execution of external commands.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::process::SystemProcesses;

/// Errors from running an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to execute {cmd_line}: {source}")]
    Spawn {
        cmd_line: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{description} failed ({status}): {stderr}")]
    Failed {
        description: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{description} timed out after {}s", timeout.as_secs())]
    TimedOut {
        description: String,
        timeout: Duration,
    },
}

/// Execute a command with logging and a timeout, returning trimmed stdout.
///
/// Logs the full command line at debug level and `description` at info
/// level. The child runs in its own process group, and the whole group is
/// killed if the timeout elapses.
pub async fn run_cmd(
    description: &str,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    let cmd_line = format!("{program} {}", args.join(" "));
    tracing::info!("{description}");
    tracing::debug!("exec: {cmd_line}");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| CommandError::Spawn {
        cmd_line: cmd_line.clone(),
        source,
    })?;
    let pgid = child.id();

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            cmd_line: cmd_line.clone(),
            source,
        })?,
        Err(_) => {
            tracing::error!("command timed out: {cmd_line}");
            if let Some(pgid) = pgid
                && let Err(e) = SystemProcesses::kill_group(pgid)
            {
                tracing::warn!(pgid, error = %e, "Failed to kill timed out command group");
            }
            return Err(CommandError::TimedOut {
                description: description.to_string(),
                timeout,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::error!("command failed: {cmd_line}\nstderr: {stderr}");
        return Err(CommandError::Failed {
            description: description.to_string(),
            status: output.status,
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `script` through `sh -c`.
pub async fn run_shell(
    description: &str,
    script: &str,
    timeout: Duration,
) -> Result<String, CommandError> {
    run_cmd(description, "sh", &["-c", script], timeout).await
}
