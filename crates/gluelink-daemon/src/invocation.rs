//! Single-instance execution of one daemon invocation.

use std::future::Future;
use std::path::Path;

use gluelink_core::{DaemonLock, DaemonVariant};
use tracing::{debug, info};

/// Result of a guarded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation<T> {
    /// Another instance of the same variant holds the lock; nothing was done.
    Skipped,
    Completed(T),
}

impl<T> Invocation<T> {
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Skipped => None,
            Self::Completed(value) => Some(value),
        }
    }
}

/// Run `f` while holding the `variant` lock in `lock_dir`.
///
/// If the lock is held elsewhere `f` is not called. The lock is released
/// when `f` finishes, fails, or the process dies.
pub async fn guarded<T, E, F, Fut>(
    lock_dir: &Path,
    variant: DaemonVariant,
    f: F,
) -> Result<Invocation<T>, E>
where
    E: From<gluelink_core::Error>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let Some(guard) = DaemonLock::try_acquire(lock_dir, variant)? else {
        info!(%variant, "Another instance is running, skipping");
        return Ok(Invocation::Skipped);
    };
    debug!(%variant, lock = %guard.path().display(), "Lock acquired");

    let result = f().await;
    drop(guard);
    result.map(Invocation::Completed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn runs_when_lock_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let outcome: Invocation<u32> =
            guarded(dir.path(), DaemonVariant::Supervisor, || async {
                Ok::<_, gluelink_core::Error>(7)
            })
            .await
            .unwrap();
        assert_eq!(outcome, Invocation::Completed(7));
    }

    #[tokio::test]
    async fn skips_without_side_effect_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let _held = DaemonLock::try_acquire(dir.path(), DaemonVariant::Reconnect)
            .unwrap()
            .unwrap();

        let called = AtomicBool::new(false);
        let outcome = guarded(dir.path(), DaemonVariant::Reconnect, || async {
            called.store(true, Ordering::SeqCst);
            Ok::<_, gluelink_core::Error>(())
        })
        .await
        .unwrap();

        assert!(outcome.is_skipped());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lock_is_released_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let failed: Result<Invocation<()>, gluelink_core::Error> =
            guarded(dir.path(), DaemonVariant::Bootstrap, || async {
                Err(gluelink_core::Error::State("boom".into()))
            })
            .await;
        assert!(failed.is_err());

        assert!(
            DaemonLock::try_acquire(dir.path(), DaemonVariant::Bootstrap)
                .unwrap()
                .is_some()
        );
    }
}
