//! Debounced filesystem change watching.

use git_berth_core::ChangeEvent;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default debounce window between the first buffered event and delivery.
///
/// Half a second batches the bursts typical repository mutations produce (a
/// checkout touches many paths in quick succession) without making
/// consumers feel stale. Tune it per session via
/// `SessionConfig::coalesce_window_ms`.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Errors establishing a filesystem watch.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watched root cannot be resolved on disk.
    #[error("Cannot resolve watch root {path}: {source}")]
    RootAccess {
        /// Root that was requested.
        path: PathBuf,
        /// Underlying filesystem error.
        source: std::io::Error,
    },

    /// The OS watch facility refused the subscription.
    #[error("Cannot watch {path}: {source}")]
    Unavailable {
        /// Root that was requested.
        path: PathBuf,
        /// Underlying watch error.
        source: notify::Error,
    },

    /// The delivery thread could not be started.
    #[error("Cannot start watch delivery thread: {0}")]
    Delivery(#[from] std::io::Error),
}

/// Watches a directory tree and delivers debounced, path-qualified change
/// batches to one callback.
///
/// Raw OS events flow into a dedicated delivery thread. The first buffered
/// event arms a deadline one coalescing window away; everything arriving
/// before the deadline joins the same [`ChangeEvent`]. Events confined to
/// excluded subpaths are filtered out before buffering and on their own
/// never produce a callback. When the OS reports that path-level tracking
/// was lost (event queue overflow, watch revoked), the next delivery is a
/// rescan batch covering the whole root; over-reporting there is
/// deliberate, under-reporting would be unsafe.
pub struct ChangeWatcher {
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    delivery_id: ThreadId,
    stopped: Arc<AtomicBool>,
}

impl ChangeWatcher {
    /// Starts watching `root` recursively.
    ///
    /// # Errors
    /// Returns an error if `root` cannot be resolved or the OS watch cannot
    /// be established; no partially-initialized watcher is ever returned.
    pub fn new(
        root: impl AsRef<Path>,
        excluded: Vec<PathBuf>,
        window: Duration,
        on_change: impl FnMut(ChangeEvent) + Send + 'static,
    ) -> Result<Self, WatchError> {
        Self::with_mode(root, RecursiveMode::Recursive, excluded, window, on_change)
    }

    pub(crate) fn with_mode(
        root: impl AsRef<Path>,
        mode: RecursiveMode,
        excluded: Vec<PathBuf>,
        window: Duration,
        on_change: impl FnMut(ChangeEvent) + Send + 'static,
    ) -> Result<Self, WatchError> {
        let requested = root.as_ref();
        let root = std::fs::canonicalize(requested).map_err(|source| WatchError::RootAccess {
            path: requested.to_path_buf(),
            source,
        })?;
        // Excluded subpaths may not exist yet; canonicalize best-effort so
        // prefix checks line up with the canonicalized event paths.
        let excluded: Vec<PathBuf> = excluded
            .into_iter()
            .map(|path| std::fs::canonicalize(&path).unwrap_or(path))
            .collect();

        let (raw_tx, raw_rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = raw_tx.send(result);
            },
            Config::default(),
        )
        .map_err(|source| WatchError::Unavailable {
            path: root.clone(),
            source,
        })?;
        watcher
            .watch(&root, mode)
            .map_err(|source| WatchError::Unavailable {
                path: root.clone(),
                source,
            })?;

        let stopped = Arc::new(AtomicBool::new(false));
        let delivery_stopped = Arc::clone(&stopped);
        let debouncer = Debouncer::new(root.clone(), excluded, window);
        let delivery = thread::Builder::new()
            .name("berth-watch".to_string())
            .spawn(move || delivery_loop(&raw_rx, debouncer, &delivery_stopped, on_change))?;
        let delivery_id = delivery.thread().id();

        debug!(root = %root.display(), ?window, "watching for changes");
        Ok(Self {
            root,
            watcher: Mutex::new(Some(watcher)),
            delivery: Mutex::new(Some(delivery)),
            delivery_id,
            stopped,
        })
    }

    /// Canonicalized root this watcher observes.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Releases the OS watch and stops delivery.
    ///
    /// Idempotent, and tolerates racing an in-flight delivery: once this
    /// returns, no further callback runs. The one exception is calling it
    /// from inside the callback itself, in which case the current
    /// invocation is the last.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(root = %self.root.display(), "stopping watcher");
        // Dropping the OS watcher closes the raw event channel, which ends
        // the delivery loop; the watch handle is released exactly once.
        if let Ok(mut slot) = self.watcher.lock() {
            slot.take();
        }
        if thread::current().id() == self.delivery_id {
            return;
        }
        if let Some(handle) = self.delivery.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = handle.join();
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Filters, buffers, and coalesces raw watch events into [`ChangeEvent`]s.
struct Debouncer {
    root: PathBuf,
    excluded: Vec<PathBuf>,
    window: Duration,
    pending: BTreeSet<PathBuf>,
    rescan: bool,
    deadline: Option<Instant>,
}

impl Debouncer {
    fn new(root: PathBuf, excluded: Vec<PathBuf>, window: Duration) -> Self {
        Self {
            root,
            excluded,
            window,
            pending: BTreeSet::new(),
            rescan: false,
            deadline: None,
        }
    }

    /// Absorbs one raw notification into the pending batch.
    fn absorb(&mut self, event: &Event) {
        if event.need_rescan() {
            self.mark_rescan();
            return;
        }
        for path in &event.paths {
            if self.excluded.iter().any(|prefix| path.starts_with(prefix)) {
                continue;
            }
            self.pending.insert(path.clone());
            self.arm();
        }
    }

    /// Records that path-level tracking was lost.
    fn mark_rescan(&mut self) {
        self.rescan = true;
        self.arm();
    }

    fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Takes the due batch, if anything is pending.
    fn flush(&mut self) -> Option<ChangeEvent> {
        self.deadline = None;
        if self.rescan {
            self.rescan = false;
            self.pending.clear();
            return Some(ChangeEvent::rescan(self.root.clone()));
        }
        if self.pending.is_empty() {
            return None;
        }
        Some(ChangeEvent::new(std::mem::take(&mut self.pending)))
    }
}

fn delivery_loop(
    raw: &Receiver<notify::Result<Event>>,
    mut debouncer: Debouncer,
    stopped: &AtomicBool,
    mut on_change: impl FnMut(ChangeEvent),
) {
    loop {
        let message = match debouncer.deadline() {
            None => raw.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    deliver(&mut debouncer, stopped, &mut on_change);
                    continue;
                }
                raw.recv_timeout(deadline - now)
            }
        };
        match message {
            Ok(Ok(event)) => debouncer.absorb(&event),
            Ok(Err(err)) => {
                // A watch error means path-level tracking may be gone.
                warn!(%err, "watch error; scheduling rescan");
                debouncer.mark_rescan();
            }
            Err(RecvTimeoutError::Timeout) => deliver(&mut debouncer, stopped, &mut on_change),
            Err(RecvTimeoutError::Disconnected) => {
                deliver(&mut debouncer, stopped, &mut on_change);
                break;
            }
        }
    }
}

fn deliver(
    debouncer: &mut Debouncer,
    stopped: &AtomicBool,
    on_change: &mut impl FnMut(ChangeEvent),
) {
    let Some(event) = debouncer.flush() else {
        return;
    };
    if stopped.load(Ordering::Acquire) {
        debug!("dropping change batch assembled after stop");
        return;
    }
    on_change(event);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, Flag};

    fn debouncer(excluded: Vec<PathBuf>) -> Debouncer {
        Debouncer::new(
            PathBuf::from("/repo"),
            excluded,
            Duration::from_millis(100),
        )
    }

    fn created(path: &str) -> Event {
        Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from(path))
    }

    #[test]
    fn buffers_paths_until_flushed() {
        let mut debouncer = debouncer(Vec::new());
        assert!(debouncer.deadline().is_none());

        debouncer.absorb(&created("/repo/a"));
        debouncer.absorb(&created("/repo/b"));
        assert!(debouncer.deadline().is_some());

        let event = debouncer.flush().unwrap();
        assert!(!event.rescan);
        assert_eq!(event.paths.len(), 2);
        assert!(event.paths.contains(Path::new("/repo/a")));
        assert!(event.paths.contains(Path::new("/repo/b")));

        // The batch is consumed; nothing further is due.
        assert!(debouncer.flush().is_none());
        assert!(debouncer.deadline().is_none());
    }

    #[test]
    fn duplicate_paths_coalesce() {
        let mut debouncer = debouncer(Vec::new());
        debouncer.absorb(&created("/repo/a"));
        debouncer.absorb(&created("/repo/a"));
        let event = debouncer.flush().unwrap();
        assert_eq!(event.paths.len(), 1);
    }

    #[test]
    fn excluded_paths_never_buffer() {
        let mut debouncer = debouncer(vec![PathBuf::from("/repo/.git")]);
        debouncer.absorb(&created("/repo/.git/objects/ab/cdef"));
        assert!(debouncer.deadline().is_none());
        assert!(debouncer.flush().is_none());

        // Mixed batches keep only the paths outside the exclusion.
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/repo/.git/index"))
            .add_path(PathBuf::from("/repo/src/lib.rs"));
        debouncer.absorb(&event);
        let event = debouncer.flush().unwrap();
        assert_eq!(event.paths.len(), 1);
        assert!(event.paths.contains(Path::new("/repo/src/lib.rs")));
    }

    #[test]
    fn rescan_flag_supersedes_buffered_paths() {
        let mut debouncer = debouncer(Vec::new());
        debouncer.absorb(&created("/repo/a"));
        debouncer.absorb(&created("/repo/b").set_flag(Flag::Rescan));

        let event = debouncer.flush().unwrap();
        assert!(event.rescan);
        assert_eq!(event.paths.len(), 1);
        assert!(event.paths.contains(Path::new("/repo")));
    }

    #[test]
    fn rescan_arms_delivery_even_with_no_paths() {
        let mut debouncer = debouncer(Vec::new());
        debouncer.mark_rescan();
        assert!(debouncer.deadline().is_some());
        let event = debouncer.flush().unwrap();
        assert!(event.rescan);
    }

    #[test]
    fn first_event_arms_the_deadline_once() {
        let mut debouncer = debouncer(Vec::new());
        debouncer.absorb(&created("/repo/a"));
        let armed = debouncer.deadline().unwrap();
        debouncer.absorb(&created("/repo/b"));
        assert_eq!(debouncer.deadline().unwrap(), armed);
    }
}
