//! Single-writer discipline across invocations.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::HammerError;

/// Well-known path of the advisory transaction lock.
pub(crate) const LOCK_PATH: &str = "/run/hammer.lock";

/// Held for the duration of a mutating operation. The lock file is
/// removed when the guard is dropped, including during unwinding, so
/// no exit path can leave a stale lock behind. Advisory only: it
/// serializes cooperating instances of this tool, nothing else.
#[derive(Debug)]
pub(crate) struct LockGuard {
    path: Utf8PathBuf,
}

impl LockGuard {
    pub(crate) fn acquire(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                // Record the owner for manual cleanup after a hard crash.
                let _ = write!(f, "{}", std::process::id());
                tracing::debug!("acquired lock {path}");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(HammerError::ConcurrentOperation(path).into())
            }
            Err(e) => Err(e).with_context(|| format!("Creating lock file {path}")),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_and_releases() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("hammer.lock")).unwrap();

        let guard = LockGuard::acquire(&path)?;
        let err = LockGuard::acquire(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HammerError>(),
            Some(HammerError::ConcurrentOperation(_))
        ));

        drop(guard);
        assert!(!path.exists());
        let _guard = LockGuard::acquire(&path)?;
        Ok(())
    }
}
