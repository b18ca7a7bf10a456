//! Single-file change monitoring.

use crate::watcher::{ChangeWatcher, WatchError};
use notify::RecursiveMode;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Watches one file for rewrites, including atomic replace-by-rename.
///
/// The subscription is on the file's parent directory rather than the file
/// itself: git replaces files like `packed-refs` wholesale, and a watch
/// bound to the old inode would go quiet after the first replacement.
/// Deliveries are filtered down to the named file before the callback runs.
pub struct FileMonitor {
    watcher: ChangeWatcher,
    path: PathBuf,
}

impl FileMonitor {
    /// Starts monitoring `path`. The file itself may not exist yet; its
    /// parent directory must.
    ///
    /// # Errors
    /// Returns an error if `path` has no parent directory or the parent
    /// cannot be watched.
    pub fn new(
        path: impl Into<PathBuf>,
        window: Duration,
        mut on_change: impl FnMut() + Send + 'static,
    ) -> Result<Self, WatchError> {
        let path: PathBuf = path.into();
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| not_monitorable(&path))?;
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| not_monitorable(&path))?
            .to_os_string();

        let watcher = ChangeWatcher::with_mode(
            parent,
            RecursiveMode::NonRecursive,
            Vec::new(),
            window,
            move |event| {
                let ours = event.rescan
                    || event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == Some(file_name.as_os_str()));
                if ours {
                    on_change();
                }
            },
        )?;
        Ok(Self { watcher, path })
    }

    /// Path being monitored.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the underlying watch. Idempotent.
    pub fn stop(&self) {
        self.watcher.stop();
    }
}

fn not_monitorable(path: &Path) -> WatchError {
    WatchError::RootAccess {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory to watch",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_paths_without_a_parent() {
        let result = FileMonitor::new("/", Duration::from_millis(10), || {});
        assert!(matches!(result, Err(WatchError::RootAccess { .. })));
    }
}
