//! Inter-process ownership of a data directory.
//!
//! The store keeps `next_id` and the audit chain head in memory, so two processes writing one
//! data directory would hand out the same ids and fork the audit chain. [`DataDirLock`] takes
//! an advisory exclusive lock on a file inside the directory; the lock is released when the
//! value is dropped or the process exits.

use crate::error::{WaitlistError, WaitlistResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Locks `path` without waiting.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::DataDirLocked`] if another holder already has the lock
    /// - [`WaitlistError::FileWrite`] if the lock file cannot be created or locked
    pub fn acquire(path: impl Into<PathBuf>) -> WaitlistResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(WaitlistError::FileWrite)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                let dir = path.parent().unwrap_or(path.as_path()).to_path_buf();
                tracing::error!(path = %path.display(), "data directory is already locked");
                return Err(WaitlistError::DataDirLocked(dir));
            }
            return Err(WaitlistError::FileWrite(e));
        }
        tracing::debug!(path = %path.display(), "acquired data directory lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release data directory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".waitlist.lock");

        let first = DataDirLock::acquire(&path).unwrap();
        assert!(matches!(
            DataDirLock::acquire(&path),
            Err(WaitlistError::DataDirLocked(locked)) if locked == dir.path()
        ));

        drop(first);
        let second = DataDirLock::acquire(&path).unwrap();
        assert_eq!(second.path(), path);
    }
}
