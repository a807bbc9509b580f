//! Repository-scoped advisory lock serialising apply and rollback.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::store::StateLayout;

/// Exclusive hold on `<state>/apply.lock`; released when dropped, which
/// covers early returns and unwinding panics alike.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Try once to take the lock. Contention returns [`LockError::Busy`]
    /// immediately; this never waits.
    pub fn acquire(layout: &StateLayout) -> Result<Self, LockError> {
        let path = layout.lock_path();
        fs::create_dir_all(layout.dir()).map_err(|source| LockError::Io {
            action: "create directory for",
            path: path.clone(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                action: "open",
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired repository lock");
                Ok(Self { file, path })
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!(path = %path.display(), "Repository lock is busy");
                Err(LockError::Busy { path })
            }
            Err(source) => Err(LockError::Io {
                action: "lock",
                path,
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "Failed to release repository lock");
        } else {
            debug!(path = %self.path.display(), "Released repository lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let dir = tempdir().unwrap();
        let layout = StateLayout::new(dir.path(), ".vtpatch");

        let first = LockGuard::acquire(&layout).unwrap();
        assert!(first.path().ends_with(".vtpatch/apply.lock"));
        assert!(matches!(
            LockGuard::acquire(&layout),
            Err(LockError::Busy { .. })
        ));

        drop(first);
        assert!(LockGuard::acquire(&layout).is_ok());
    }

    #[test]
    fn locks_are_scoped_per_repository() {
        let one = tempdir().unwrap();
        let two = tempdir().unwrap();

        let _a = LockGuard::acquire(&StateLayout::new(one.path(), ".vtpatch")).unwrap();
        assert!(LockGuard::acquire(&StateLayout::new(two.path(), ".vtpatch")).is_ok());
    }

    #[test]
    fn lock_is_released_when_holder_panics() {
        let dir = tempdir().unwrap();
        let layout = StateLayout::new(dir.path(), ".vtpatch");

        let result = std::panic::catch_unwind(|| {
            let _guard = LockGuard::acquire(&layout).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(LockGuard::acquire(&layout).is_ok());
    }
}
