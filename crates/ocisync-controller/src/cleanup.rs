//! Scoped cache cleanup.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Removes a directory tree when dropped, if asked to.
///
/// Removal runs on every exit path of the owning scope, including errors
/// and unwinding. Failures are logged and never propagated.
#[derive(Debug)]
pub struct CacheGuard {
    path: PathBuf,
    remove: bool,
}

impl CacheGuard {
    /// Guards `path`; the tree is deleted on drop only when `remove` is set.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, remove: bool) -> Self {
        Self {
            path: path.into(),
            remove,
        }
    }

    /// Guarded path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the directory regardless of the original setting.
    pub fn disarm(&mut self) {
        self.remove = false;
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if !self.remove {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Removed cache directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Could not remove cache directory"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populated(dir: &TempDir) -> PathBuf {
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(cache.join("blobs/sha256")).unwrap();
        std::fs::write(cache.join("blobs/sha256/x"), b"x").unwrap();
        cache
    }

    #[test]
    fn test_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let cache = populated(&dir);

        drop(CacheGuard::new(&cache, true));
        assert!(!cache.exists());
    }

    #[test]
    fn test_keeps_when_not_requested() {
        let dir = TempDir::new().unwrap();
        let cache = populated(&dir);

        drop(CacheGuard::new(&cache, false));
        assert!(cache.exists());

        let mut guard = CacheGuard::new(&cache, true);
        guard.disarm();
        drop(guard);
        assert!(cache.exists());
    }

    #[test]
    fn test_removes_on_error_path() {
        fn failing(cache: &Path) -> Result<(), String> {
            let _guard = CacheGuard::new(cache, true);
            Err("batch failed".to_string())
        }

        let dir = TempDir::new().unwrap();
        let cache = populated(&dir);

        assert!(failing(&cache).is_err());
        assert!(!cache.exists());
    }

    #[test]
    fn test_missing_directory_is_ignored() {
        let dir = TempDir::new().unwrap();
        drop(CacheGuard::new(dir.path().join("never-created"), true));
    }
}
