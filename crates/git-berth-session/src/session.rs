//! One live repository: serialized operations, change watching, caches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use git_berth_backend_git::GitBackend;
use git_berth_core::{CommitSummary, PositionCache, RepoNotification};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::repo_watcher::{NotificationSink, RepoWatcher};
use crate::task_queue::{OpKind, QueueClosed, TaskQueue};
use crate::watcher::ChangeWatcher;

/// A session over one Git repository.
///
/// Owns the serialized task queue every operation runs on, the watchers
/// that translate on-disk changes into [`RepoNotification`]s, and the
/// caches those notifications keep honest. All methods are callable from
/// any thread; observability accessors never block behind repository work.
///
/// Dropping the session closes it: the queue drains, the watchers stop.
pub struct RepoSession {
    backend: Arc<GitBackend>,
    queue: TaskQueue,
    notifications: broadcast::Sender<RepoNotification>,
    repo_watcher: RepoWatcher,
    workspace_watcher: Option<ChangeWatcher>,
    commit_positions: Arc<PositionCache<String>>,
    cached_head: Arc<Mutex<Option<String>>>,
}

impl RepoSession {
    /// Discover the repository containing `cwd_or_repo` and open a session
    /// over it, loading tunables from `.git-berth.toml` in its working tree.
    ///
    /// # Errors
    /// Returns an error if no repository can be discovered, the
    /// configuration file is invalid, or watching the repository fails.
    pub fn open(cwd_or_repo: impl AsRef<Path>) -> Result<Self, SessionError> {
        let backend = Arc::new(GitBackend::open(cwd_or_repo)?);
        let config = match backend.workdir() {
            Some(workdir) => SessionConfig::load_or_default(workdir)?,
            None => SessionConfig::default(),
        };
        Self::with_config(backend, &config)
    }

    /// Open a session with explicit tunables, ignoring any on-disk
    /// configuration file.
    ///
    /// # Errors
    /// Returns an error if no repository can be discovered or watching the
    /// repository fails.
    pub fn open_with(
        cwd_or_repo: impl AsRef<Path>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let backend = Arc::new(GitBackend::open(cwd_or_repo)?);
        Self::with_config(backend, config)
    }

    fn with_config(backend: Arc<GitBackend>, config: &SessionConfig) -> Result<Self, SessionError> {
        let label = queue_label(backend.workdir(), backend.git_dir());
        let queue = TaskQueue::new(label).map_err(SessionError::Spawn)?;

        let commit_positions = Arc::new(PositionCache::new());
        let cached_head = Arc::new(Mutex::new(None));
        let (notifications, _) = broadcast::channel(config.notification_capacity());

        // Cache effects run before the broadcast, so a subscriber that
        // reacts immediately observes post-invalidation state.
        let sink: NotificationSink = {
            let positions = Arc::clone(&commit_positions);
            let head = Arc::clone(&cached_head);
            let tx = notifications.clone();
            Arc::new(move |notification: RepoNotification| {
                apply_cache_effects(&positions, &head, &notification);
                let _ = tx.send(notification);
            })
        };

        let window = config.coalesce_window();
        let repo_watcher = RepoWatcher::new(Arc::clone(&backend), Arc::clone(&sink), window)?;
        let workspace_watcher = open_workspace_watcher(&backend, config, &sink)?;

        info!(
            queue = %queue.label(),
            git_dir = %backend.git_dir().display(),
            workspace = workspace_watcher.is_some(),
            "session opened"
        );
        Ok(Self {
            backend,
            queue,
            notifications,
            repo_watcher,
            workspace_watcher,
            commit_positions,
            cached_head,
        })
    }

    /// Path of the repository's git directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        self.backend.git_dir()
    }

    /// Path of the working tree, absent for bare repositories.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.backend.workdir()
    }

    /// Submits `op` to run against the backend on the session queue, after
    /// everything submitted before it.
    ///
    /// # Errors
    /// Returns [`QueueClosed`] once the session is closed.
    pub fn submit<F>(&self, kind: OpKind, op: F) -> Result<(), QueueClosed>
    where
        F: FnOnce(&GitBackend) + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        self.queue.submit(kind, move || op(backend.as_ref()))
    }

    /// Runs `op` against the backend on the session queue and blocks for
    /// its result.
    ///
    /// # Errors
    /// Returns [`QueueClosed`] once the session is closed.
    pub fn run_sync<T, F>(&self, op: F) -> Result<T, QueueClosed>
    where
        F: FnOnce(&GitBackend) -> T + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        self.queue.run_sync(move || op(backend.as_ref()))
    }

    /// Snapshot of every reference and the commit id it resolves to.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the reference database
    /// cannot be read.
    pub fn refs(&self) -> Result<BTreeMap<String, String>, SessionError> {
        let targets = self.run_sync(GitBackend::reference_targets)??;
        Ok(targets)
    }

    /// Name `HEAD` points at, cached until a head change is observed.
    ///
    /// # Errors
    /// Returns an error if the session is closed or `HEAD` cannot be read.
    pub fn head_name(&self) -> Result<Option<String>, SessionError> {
        if let Some(name) = lock(&self.cached_head).clone() {
            return Ok(Some(name));
        }
        let name = self.run_sync(GitBackend::head_name)??;
        if let Some(name) = &name {
            *lock(&self.cached_head) = Some(name.clone());
        }
        Ok(name)
    }

    /// Commit id `HEAD` resolves to, or `None` while unborn.
    ///
    /// # Errors
    /// Returns an error if the session is closed or `HEAD` cannot be
    /// resolved.
    pub fn head_target(&self) -> Result<Option<String>, SessionError> {
        let target = self.run_sync(GitBackend::head_target)??;
        Ok(target)
    }

    /// Digest of one commit.
    ///
    /// # Errors
    /// Returns an error if the session is closed, `id` is malformed, or the
    /// commit does not exist.
    pub fn commit_summary(&self, id: &str) -> Result<CommitSummary, SessionError> {
        let id = id.to_string();
        let summary = self.run_sync(move |backend| backend.commit_summary(&id))??;
        Ok(summary)
    }

    /// Creates a local branch at `target`, or at `HEAD` when `target` is
    /// `None`, and returns its full reference name. The resulting refs
    /// change is reported through the notification stream like any other
    /// on-disk change.
    ///
    /// # Errors
    /// Returns an error if the session is closed, another writer is active,
    /// or the branch cannot be created.
    pub fn create_branch(&self, name: &str, target: Option<&str>) -> Result<String, SessionError> {
        let name = name.to_string();
        let target = target.map(str::to_string);
        let refname = self.run_sync(move |backend| {
            backend.perform_writing(|repo| repo.create_branch(&name, target.as_deref()))
        })??;
        Ok(refname)
    }

    /// Position of a commit in the history walked from `HEAD` (0 = newest),
    /// or `None` when the commit is not reachable.
    ///
    /// Served from a position cache that head and refs changes invalidate;
    /// a miss walks the history once and records every position.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the history walk fails.
    pub fn position_of_commit(&self, id: &str) -> Result<Option<usize>, SessionError> {
        if let Some(position) = self.commit_positions.lookup(id) {
            return Ok(Some(position));
        }
        let ids = self.run_sync(|backend| backend.history_ids(None))??;
        for (position, commit_id) in ids.into_iter().enumerate() {
            self.commit_positions.record(commit_id, position);
        }
        Ok(self.commit_positions.lookup(id))
    }

    /// Subscribes to repository notifications. Slow consumers may observe a
    /// lagged error and should treat it as "everything may have changed".
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RepoNotification> {
        self.notifications.subscribe()
    }

    /// Whether any queued operation is pending. Never blocks.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    /// Subscribes to busy-flag transitions.
    #[must_use]
    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        self.queue.busy_watch()
    }

    /// Number of operations accepted and not yet finished.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// Blocks until every operation submitted so far has completed.
    pub fn wait(&self) {
        self.queue.wait();
    }

    /// Refuses new work; operations already accepted still run. Idempotent.
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// Shuts the session down: refuses new work, drains what was accepted,
    /// stops the watchers. Idempotent; no notification is delivered after
    /// it returns.
    pub fn close(&self) {
        self.queue.shut_down();
        self.queue.wait();
        self.repo_watcher.stop();
        if let Some(watcher) = &self.workspace_watcher {
            watcher.stop();
        }
        debug!(queue = %self.queue.label(), "session closed");
    }
}

impl Drop for RepoSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Invalidation rules tying notifications to session caches.
///
/// A head or refs change can rewrite the history walk, so commit positions
/// go stale wholesale; the head name is cheap to re-read, so it is simply
/// dropped. Everything else leaves the caches alone.
fn apply_cache_effects(
    positions: &PositionCache<String>,
    cached_head: &Mutex<Option<String>>,
    notification: &RepoNotification,
) {
    match notification {
        RepoNotification::HeadChanged | RepoNotification::RefsChanged(_) => {
            positions.invalidate_from(0);
            lock(cached_head).take();
            debug!(%notification, "invalidated session caches");
        }
        _ => {}
    }
}

fn open_workspace_watcher(
    backend: &Arc<GitBackend>,
    config: &SessionConfig,
    sink: &NotificationSink,
) -> Result<Option<ChangeWatcher>, SessionError> {
    if !config.watch_workspace() {
        return Ok(None);
    }
    let Some(workdir) = backend.workdir() else {
        debug!("bare repository; not watching a working tree");
        return Ok(None);
    };
    let mut excluded = vec![backend.git_dir().to_path_buf()];
    for subpath in config.exclude() {
        if subpath.is_absolute() {
            excluded.push(subpath.clone());
        } else {
            excluded.push(workdir.join(subpath));
        }
    }
    let sink = Arc::clone(sink);
    let watcher = ChangeWatcher::new(workdir, excluded, config.coalesce_window(), move |event| {
        sink(RepoNotification::WorkspaceChanged(event));
    })?;
    Ok(Some(watcher))
}

fn queue_label(workdir: Option<&Path>, git_dir: &Path) -> String {
    let root = workdir.unwrap_or(git_dir);
    root.file_name()
        .map_or_else(|| "repo".to_string(), |name| name.to_string_lossy().into_owned())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use git_berth_core::RefsDelta;

    use super::*;

    #[test]
    fn queue_label_prefers_the_workdir_name() {
        let workdir = PathBuf::from("/home/dev/projects/berth");
        let git_dir = PathBuf::from("/home/dev/projects/berth/.git");
        assert_eq!(queue_label(Some(&workdir), &git_dir), "berth");
    }

    #[test]
    fn queue_label_uses_the_git_dir_when_bare() {
        let git_dir = PathBuf::from("/srv/repos/berth.git");
        assert_eq!(queue_label(None, &git_dir), "berth.git");
    }

    #[test]
    fn queue_label_survives_rootless_paths() {
        assert_eq!(queue_label(None, Path::new("/")), "repo");
    }

    #[test]
    fn head_change_drops_positions_and_head_name() {
        let positions = PositionCache::new();
        positions.record("abc".to_string(), 0);
        let head = Mutex::new(Some("refs/heads/main".to_string()));

        apply_cache_effects(&positions, &head, &RepoNotification::HeadChanged);
        assert_eq!(positions.lookup("abc"), None);
        assert!(head.lock().unwrap().is_none());
    }

    #[test]
    fn refs_change_drops_positions() {
        let positions = PositionCache::new();
        positions.record("abc".to_string(), 3);
        let head = Mutex::new(None);

        let mut delta = RefsDelta::default();
        delta.added.insert("refs/heads/topic".to_string());
        apply_cache_effects(&positions, &head, &RepoNotification::RefsChanged(delta));
        assert_eq!(positions.lookup("abc"), None);
    }

    #[test]
    fn workspace_change_leaves_caches_alone() {
        let positions = PositionCache::new();
        positions.record("abc".to_string(), 1);
        let head = Mutex::new(Some("refs/heads/main".to_string()));

        apply_cache_effects(&positions, &head, &RepoNotification::IndexChanged);
        assert_eq!(positions.lookup("abc"), Some(1));
        assert!(head.lock().unwrap().is_some());
    }
}
