//! Shared tracing/logging initialization.
//!
//! Every gluelink invocation logs to stderr and, when a log file is given,
//! appends the same events to a daily rotated file (one series per daemon
//! variant). Raw output that bypasses tracing (cron redirects, the keeper's
//! ssh stderr) is size-capped with [`cap_log_file`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Rotated tracing files kept per variant (one per day).
pub const MAX_LOG_FILES: usize = 7;

/// Size at which a raw output file is rotated.
pub const RAW_LOG_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Rotated copies kept of a raw output file.
pub const RAW_LOG_BACKUPS: u32 = 5;

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"gluelink=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `log_file` -- optional log file. `<dir>/supervisor.log` is written as
///   `<dir>/supervisor.<date>.log`, rotated daily, keeping [`MAX_LOG_FILES`].
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init_tracing(
    default_filter: &str,
    log_json: bool,
    log_file: Option<&Path>,
) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    let mut layers = Vec::new();
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    layers.push(if log_json {
        stderr_layer.json().boxed()
    } else {
        stderr_layer.boxed()
    });

    let mut guard = None;
    let mut file_error = None;
    if let Some(path) = log_file {
        match file_appender(path) {
            Ok(appender) => {
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(worker_guard);

                let file_layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer);
                layers.push(if log_json {
                    file_layer.json().boxed()
                } else {
                    file_layer.boxed()
                });
            }
            Err(e) => file_error = Some((path.to_path_buf(), e)),
        }
    }

    // Ignore a second initialisation (tests, the runner re-entering).
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    if let Some((path, e)) = file_error {
        tracing::warn!(path = %path.display(), error = %e, "Logging to stderr only");
    }
    guard
}

/// Daily rolling appender for `path`: the file stem becomes the prefix and
/// the extension the suffix of each dated file.
pub fn file_appender(path: &Path) -> io::Result<RollingFileAppender> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no file name in {}", path.display()),
            )
        })?;
    fs::create_dir_all(dir)?;

    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES);
    if let Some(suffix) = path.extension().and_then(|ext| ext.to_str()) {
        builder = builder.filename_suffix(suffix);
    }
    builder
        .build(dir)
        .map_err(|e| io::Error::other(e.to_string()))
}

/// Rotate `path` to `path.1` (shifting older copies up to `path.<backups>`)
/// once it reaches `max_bytes`.
///
/// Returns whether a rotation happened. A missing file is not rotated.
pub fn cap_log_file(path: &Path, max_bytes: u64, backups: u32) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size < max_bytes {
        return Ok(false);
    }
    if backups == 0 {
        fs::remove_file(path)?;
        return Ok(true);
    }

    for n in (1..backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(true)
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
