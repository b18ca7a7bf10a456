//! Error types for repository session operations.

use thiserror::Error;

use git_berth_backend_git::BackendError;

use crate::{config::ConfigError, task_queue::QueueClosed, watcher::WatchError};

/// Errors that can occur while opening or driving a `RepoSession`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The Git backend reported an error.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Establishing or driving a filesystem watch failed.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The session queue has shut down and no longer accepts work.
    #[error(transparent)]
    Closed(#[from] QueueClosed),

    /// Loading the session configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Spawning the session worker thread failed.
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[source] std::io::Error),
}
