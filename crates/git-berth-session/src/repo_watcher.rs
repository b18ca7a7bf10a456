//! Classification of git-dir changes into repository notifications.

use crate::file_monitor::FileMonitor;
use crate::watcher::{ChangeWatcher, WatchError};
use git_berth_backend_git::GitBackend;
use git_berth_core::{ChangeEvent, RefsDelta, RepoNotification};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Where classified notifications go; injected by whoever composes the
/// watcher so the pipeline stays testable in isolation.
pub type NotificationSink = Arc<dyn Fn(RepoNotification) + Send + Sync>;

/// Watches a repository's git dir and classifies raw path changes into
/// [`RepoNotification`]s.
///
/// The recursive watch excludes `objects/`: object writes are bulky and
/// change nothing a front end shows until a reference moves. `packed-refs`
/// and the stash log are additionally covered by single-file monitors
/// because git rewrites them by atomic replacement.
pub struct RepoWatcher {
    git_watcher: ChangeWatcher,
    packed_refs: Option<FileMonitor>,
    stash: Option<FileMonitor>,
}

impl RepoWatcher {
    /// Starts watching the git dir of `backend`, reporting through `sink`.
    ///
    /// Takes an initial snapshot of the reference namespace and the index
    /// mtime so the first deliveries diff against the state at
    /// construction.
    ///
    /// # Errors
    /// Returns an error if the git dir cannot be watched.
    pub fn new(
        backend: Arc<GitBackend>,
        sink: NotificationSink,
        window: Duration,
    ) -> Result<Self, WatchError> {
        let git_dir =
            std::fs::canonicalize(backend.git_dir()).map_err(|source| WatchError::RootAccess {
                path: backend.git_dir().to_path_buf(),
                source,
            })?;
        let initial_refs = backend.reference_targets().unwrap_or_else(|err| {
            warn!(%err, "initial reference snapshot failed");
            BTreeMap::new()
        });
        let state = Arc::new(WatcherState {
            backend,
            sink,
            index_mtime: Mutex::new(index_mtime(&git_dir)),
            refs_snapshot: Mutex::new(initial_refs),
            git_dir: git_dir.clone(),
        });

        let excluded = vec![git_dir.join("objects")];
        let observer = Arc::clone(&state);
        let git_watcher = ChangeWatcher::new(&git_dir, excluded, window, move |event| {
            observer.observe(&event);
        })?;

        // Both files come and go during normal operation; a repository
        // without them simply has nothing to monitor yet.
        let packed_state = Arc::clone(&state);
        let packed_refs = FileMonitor::new(git_dir.join("packed-refs"), window, move || {
            packed_state.scan_refs();
        })
        .inspect_err(|err| debug!(%err, "packed-refs monitor unavailable"))
        .ok();
        let stash_state = Arc::clone(&state);
        let stash = FileMonitor::new(
            git_dir.join("logs").join("refs").join("stash"),
            window,
            move || stash_state.emit(RepoNotification::StashChanged),
        )
        .inspect_err(|err| debug!(%err, "stash monitor unavailable"))
        .ok();

        Ok(Self {
            git_watcher,
            packed_refs,
            stash,
        })
    }

    /// Canonicalized git dir under watch.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        self.git_watcher.root()
    }

    /// Stops every underlying watch. Idempotent.
    pub fn stop(&self) {
        self.git_watcher.stop();
        if let Some(monitor) = &self.packed_refs {
            monitor.stop();
        }
        if let Some(monitor) = &self.stash {
            monitor.stop();
        }
    }
}

struct WatcherState {
    backend: Arc<GitBackend>,
    sink: NotificationSink,
    git_dir: PathBuf,
    refs_snapshot: Mutex<BTreeMap<String, String>>,
    index_mtime: Mutex<Option<SystemTime>>,
}

impl WatcherState {
    fn emit(&self, notification: RepoNotification) {
        (self.sink)(notification);
    }

    fn observe(&self, event: &ChangeEvent) {
        debug!(
            paths = event.paths.len(),
            rescan = event.rescan,
            "git dir changed"
        );
        if event.rescan {
            // Path-level tracking was lost; re-check every topic.
            self.check_index();
            self.scan_refs();
            self.emit(RepoNotification::HeadChanged);
            self.emit(RepoNotification::RefLogChanged);
            return;
        }

        // The index file is rewritten for staging, checkout, and merges;
        // an mtime check per batch is cheaper than tracking its many
        // producers by path.
        self.check_index();

        let relative: Vec<&Path> = event
            .paths
            .iter()
            .filter_map(|path| path.strip_prefix(&self.git_dir).ok())
            .collect();
        if relative.iter().any(|path| *path == Path::new("HEAD")) {
            self.emit(RepoNotification::HeadChanged);
        }
        if relative.iter().any(|path| path.starts_with("refs")) {
            self.scan_refs();
        }
        if relative.iter().any(|path| path.starts_with("logs")) {
            self.emit(RepoNotification::RefLogChanged);
        }
    }

    fn check_index(&self) {
        let current = index_mtime(&self.git_dir);
        let mut stored = lock(&self.index_mtime);
        if *stored != current {
            *stored = current;
            drop(stored);
            self.emit(RepoNotification::IndexChanged);
        }
    }

    fn scan_refs(&self) {
        let current = match self.backend.reference_targets() {
            Ok(refs) => refs,
            Err(err) => {
                warn!(%err, "reference snapshot failed");
                return;
            }
        };
        let mut snapshot = lock(&self.refs_snapshot);
        let delta = diff_refs(&snapshot, &current);
        *snapshot = current;
        drop(snapshot);
        if let Some(delta) = delta {
            self.emit(RepoNotification::RefsChanged(delta));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Names the references that differ between two snapshots, or `None` when
/// nothing moved.
fn diff_refs(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Option<RefsDelta> {
    let mut delta = RefsDelta::default();
    for (name, target) in new {
        match old.get(name) {
            None => {
                delta.added.insert(name.clone());
            }
            Some(previous) if previous != target => {
                delta.changed.insert(name.clone());
            }
            Some(_) => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            delta.deleted.insert(name.clone());
        }
    }
    (!delta.is_empty()).then_some(delta)
}

fn index_mtime(git_dir: &Path) -> Option<SystemTime> {
    std::fs::metadata(git_dir.join("index"))
        .and_then(|metadata| metadata.modified())
        .ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, target)| ((*name).to_string(), (*target).to_string()))
            .collect()
    }

    #[test]
    fn identical_snapshots_produce_no_delta() {
        let refs = snapshot(&[("refs/heads/main", "aaa")]);
        assert_eq!(diff_refs(&refs, &refs), None);
    }

    #[test]
    fn delta_classifies_added_deleted_and_changed() {
        let old = snapshot(&[
            ("refs/heads/main", "aaa"),
            ("refs/heads/gone", "bbb"),
            ("refs/tags/v1", "ccc"),
        ]);
        let new = snapshot(&[
            ("refs/heads/main", "ddd"),
            ("refs/heads/topic", "eee"),
            ("refs/tags/v1", "ccc"),
        ]);

        let delta = diff_refs(&old, &new).unwrap();
        assert!(delta.added.contains("refs/heads/topic"));
        assert!(delta.deleted.contains("refs/heads/gone"));
        assert!(delta.changed.contains("refs/heads/main"));
        assert!(!delta.changed.contains("refs/tags/v1"));
        assert_eq!(delta.added.len() + delta.deleted.len() + delta.changed.len(), 3);
    }

    #[test]
    fn missing_index_has_no_mtime() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(index_mtime(dir.path()), None);
    }
}
