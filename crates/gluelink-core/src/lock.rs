//! Per-variant daemon locks.
//!
//! Each daemon variant owns `<lock_dir>/<variant>.lock`. Acquisition is a
//! non-blocking exclusive `flock`; the lock lives exactly as long as the open
//! file description, so it is released when the guard drops or when the
//! holding process dies for any reason. There is no explicit unlock.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};

/// The independently locked daemon variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonVariant {
    Supervisor,
    Reconnect,
    Bootstrap,
    /// Held by a tunnel keeper for its whole lifetime.
    Tunnel,
}

impl DaemonVariant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Reconnect => "reconnect",
            Self::Bootstrap => "bootstrap",
            Self::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for DaemonVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry point for acquiring daemon locks.
pub struct DaemonLock;

impl DaemonLock {
    /// Path of the lock file for `variant` under `dir`.
    pub fn path(dir: &Path, variant: DaemonVariant) -> PathBuf {
        dir.join(format!("{variant}.lock"))
    }

    /// Try to acquire the lock for `variant` without blocking.
    ///
    /// Returns `Ok(Some(guard))` if acquired, `Ok(None)` if another open file
    /// description (in this or another process) currently holds it.
    pub fn try_acquire(dir: &Path, variant: DaemonVariant) -> Result<Option<LockGuard>> {
        let path = Self::path(dir, variant);
        fs::create_dir_all(dir).map_err(|source| Error::Lock {
            path: path.clone(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| Error::Lock {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                debug!(variant = %variant, path = %path.display(), "Lock held elsewhere");
                return Ok(None);
            }
            Err(source) => return Err(Error::Lock { path, source }),
        }

        let mut guard = LockGuard {
            file,
            path,
            variant,
        };
        guard.record_holder();
        Ok(Some(guard))
    }

    /// Pid of the process currently holding the lock for `variant`, if held.
    ///
    /// A held lock whose file does not name a pid yet is an error; the holder
    /// writes its pid right after locking, so callers can retry later.
    pub fn holder(dir: &Path, variant: DaemonVariant) -> Result<Option<u32>> {
        let path = Self::path(dir, variant);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Lock { path, source }),
        };

        match FileExt::try_lock_shared(&file) {
            // Closing the file releases the test lock.
            Ok(()) => return Ok(None),
            Err(e) if is_contended(&e) => {}
            Err(source) => return Err(Error::Lock { path, source }),
        }

        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|source| Error::Lock {
                path: path.clone(),
                source,
            })?;
        content.trim().parse().map(Some).map_err(|_| {
            Error::State(format!(
                "{} is held but does not name its holder",
                path.display()
            ))
        })
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// RAII guard for a held daemon lock.
///
/// The underlying `flock` is released by the OS when the file descriptor is
/// closed, which happens on drop or process exit.
pub struct LockGuard {
    file: File,
    path: PathBuf,
    variant: DaemonVariant,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn variant(&self) -> DaemonVariant {
        self.variant
    }

    /// Write the holder pid into the lock file for diagnostics. Best effort.
    fn record_holder(&mut self) {
        let pid = std::process::id();
        let result = self
            .file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(self.file, "{pid}"));
        if let Err(e) = result {
            debug!(path = %self.path.display(), error = %e, "Failed to record lock holder");
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("variant", &self.variant)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
