//! Git-backed repository access for git-berth.
//!
//! [`GitBackend`] is the shared, externally-mutable data source the session
//! layer serializes access to. It is deliberately synchronous: callers are
//! expected to reach it through a task queue, and the internal mutex only
//! exists so that misuse cannot corrupt libgit2 state.

/// Error types.
pub mod error;

pub use error::{BackendError, Result};

use git_berth_core::CommitSummary;
use git2::{ErrorCode, Oid, Repository, Sort};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const SUMMARY_CACHE_CAPACITY: usize = 256;

/// Thread-safe wrapper over one on-disk Git repository.
///
/// `git2::Repository` is `Send` but not `Sync`, so every libgit2 call goes
/// through a mutex. The git dir and workdir paths are captured at open time
/// and readable without taking that lock.
pub struct GitBackend {
    repo: Mutex<Repository>,
    git_dir: PathBuf,
    workdir: Option<PathBuf>,
    summary_cache: Mutex<LruCache<String, CommitSummary>>,
    writing: AtomicBool,
}

impl GitBackend {
    /// Discover and open the repository containing `cwd_or_repo`.
    ///
    /// # Errors
    /// Returns an error if no Git repository can be discovered from the
    /// given path.
    pub fn open(cwd_or_repo: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::discover(cwd_or_repo)?;
        let git_dir = repo.path().to_path_buf();
        let workdir = repo.workdir().map(Path::to_path_buf);
        debug!(git_dir = %git_dir.display(), bare = workdir.is_none(), "opened repository");
        Ok(Self {
            repo: Mutex::new(repo),
            git_dir,
            workdir,
            summary_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SUMMARY_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            writing: AtomicBool::new(false),
        })
    }

    /// Path of the repository's git directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Path of the working tree, absent for bare repositories.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Whether the repository has no working tree.
    #[must_use]
    pub fn is_bare(&self) -> bool {
        self.workdir.is_none()
    }

    /// Name `HEAD` currently points at: the symbolic target while on a
    /// branch (born or not), or `HEAD` itself when detached.
    ///
    /// # Errors
    /// Returns an error if the `HEAD` reference cannot be read.
    pub fn head_name(&self) -> Result<Option<String>> {
        let repo = self.repo();
        let head = match repo.find_reference("HEAD") {
            Ok(reference) => reference,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Some(target) = head.symbolic_target() {
            return Ok(Some(target.to_string()));
        }
        Ok(head.name().map(str::to_string))
    }

    /// Commit id `HEAD` resolves to, or `None` while the current branch is
    /// unborn.
    ///
    /// # Errors
    /// Returns an error if `HEAD` cannot be resolved for any reason other
    /// than pointing at an unborn branch.
    pub fn head_target(&self) -> Result<Option<String>> {
        let repo = self.repo();
        match repo.head() {
            Ok(head) => Ok(head.target().map(|oid| oid.to_string())),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Snapshot of every reference under `refs/` mapped to the commit id it
    /// resolves to. Individual unreadable references are skipped.
    ///
    /// # Errors
    /// Returns an error if the reference database cannot be iterated.
    pub fn reference_targets(&self) -> Result<BTreeMap<String, String>> {
        let repo = self.repo();
        let mut targets = BTreeMap::new();
        for reference in repo.references()? {
            let reference = match reference {
                Ok(reference) => reference,
                Err(err) => {
                    debug!(%err, "skipping unreadable reference");
                    continue;
                }
            };
            let Some(name) = reference.name() else {
                continue;
            };
            let resolved = match reference.resolve() {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!(reference = name, %err, "skipping unresolvable reference");
                    continue;
                }
            };
            if let Some(target) = resolved.target() {
                targets.insert(name.to_string(), target.to_string());
            }
        }
        Ok(targets)
    }

    /// Commit ids reachable from `HEAD`, newest first (topological order,
    /// ties broken by time), at most `limit` of them. Empty while the
    /// current branch is unborn.
    ///
    /// # Errors
    /// Returns an error if the revision walk fails.
    pub fn history_ids(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let repo = self.repo();
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        if let Err(err) = walk.push_head() {
            if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
        let mut ids = Vec::new();
        for oid in walk {
            ids.push(oid?.to_string());
            if limit.is_some_and(|max| ids.len() >= max) {
                break;
            }
        }
        debug!(count = ids.len(), "walked history");
        Ok(ids)
    }

    /// Digest of the commit named by the hex id `id`, served from an LRU
    /// cache where possible. Commit content never changes for a given id,
    /// so cached digests need no invalidation.
    ///
    /// # Errors
    /// Returns an error if `id` is not a valid commit id or the commit does
    /// not exist.
    pub fn commit_summary(&self, id: &str) -> Result<CommitSummary> {
        if let Some(summary) = self.cached_summary(id) {
            return Ok(summary);
        }
        let summary = self.decode_summary(id)?;
        self.cache_summary(&summary);
        Ok(summary)
    }

    /// Creates a local branch named `name` at `target` (a commit id), or at
    /// `HEAD` when `target` is `None`. Returns the full reference name.
    ///
    /// A mutating call: run it through [`perform_writing`](Self::perform_writing).
    ///
    /// # Errors
    /// Returns an error if the target cannot be resolved, the branch
    /// already exists, or `HEAD` is unborn.
    pub fn create_branch(&self, name: &str, target: Option<&str>) -> Result<String> {
        let repo = self.repo();
        let oid = match target {
            Some(hex) => parse_oid(hex)?,
            None => repo
                .head()
                .map_err(|err| match err.code() {
                    ErrorCode::UnbornBranch | ErrorCode::NotFound => BackendError::UnbornHead,
                    _ => err.into(),
                })?
                .target()
                .ok_or(BackendError::UnbornHead)?,
        };
        let commit = repo.find_commit(oid)?;
        let branch = repo.branch(name, &commit, false)?;
        let refname = branch.get().name().unwrap_or(name).to_string();
        info!(branch = %refname, target = %oid, "created branch");
        Ok(refname)
    }

    /// Whether a [`perform_writing`](Self::perform_writing) call is in
    /// progress.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Runs `operation` with this backend marked as writing.
    ///
    /// Overlapping writers fail fast instead of queueing behind a mutation
    /// they cannot see: the session's task queue already serializes
    /// well-behaved callers, so a second writer here is always a caller
    /// that bypassed it. The mark is cleared however `operation` exits.
    ///
    /// # Errors
    /// Returns [`BackendError::AlreadyWriting`] when another writer holds
    /// the mark, or whatever `operation` itself returns.
    pub fn perform_writing<T>(&self, operation: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackendError::AlreadyWriting);
        }
        let guard = WriteMark(&self.writing);
        let result = operation(self);
        drop(guard);
        result
    }

    fn cached_summary(&self, id: &str) -> Option<CommitSummary> {
        self.summary_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(id).cloned())
    }

    fn cache_summary(&self, summary: &CommitSummary) {
        if let Ok(mut cache) = self.summary_cache.lock() {
            cache.put(summary.id.clone(), summary.clone());
        }
    }

    fn decode_summary(&self, id: &str) -> Result<CommitSummary> {
        let oid = parse_oid(id)?;
        let repo = self.repo();
        let commit = repo.find_commit(oid)?;
        let author = commit.author();
        let time = OffsetDateTime::from_unix_timestamp(author.when().seconds())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Ok(CommitSummary {
            id: oid.to_string(),
            summary: commit.summary().unwrap_or_default().to_string(),
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            time,
        })
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        match self.repo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("repository mutex poisoned; continuing");
                poisoned.into_inner()
            }
        }
    }
}

/// Clears the writing mark when dropped, so a panicking operation cannot
/// leave the backend refusing writes forever.
struct WriteMark<'a>(&'a AtomicBool);

impl Drop for WriteMark<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn parse_oid(hex: &str) -> Result<Oid> {
    hex.parse()
        .map_err(|_| BackendError::InvalidId(hex.to_string()))
}
