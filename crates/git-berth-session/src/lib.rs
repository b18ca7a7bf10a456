//! Session layer for Git front ends.
//!
//! A [`RepoSession`] wraps one on-disk repository with the concurrency
//! machinery an interactive client needs: a [`TaskQueue`] that serializes
//! repository operations on a dedicated worker, filesystem watchers that
//! turn external changes into classified [`RepoNotification`]s, and caches
//! that those notifications invalidate.
//!
//! [`RepoNotification`]: git_berth_core::RepoNotification

/// Session tuning loaded from a per-repository file.
pub mod config;
/// Error types.
pub mod error;
/// Change monitoring for one file.
pub mod file_monitor;
/// Git-directory watching and change classification.
pub mod repo_watcher;
/// The repository session itself.
pub mod session;
/// Serialized operation execution.
pub mod task_queue;
/// Debounced filesystem change watching.
pub mod watcher;

pub use config::{ConfigError, SessionConfig, CONFIG_FILE};
pub use error::SessionError;
pub use file_monitor::FileMonitor;
pub use repo_watcher::{NotificationSink, RepoWatcher};
pub use session::RepoSession;
pub use task_queue::{OpKind, QueueClosed, TaskQueue};
pub use watcher::{ChangeWatcher, WatchError, DEFAULT_COALESCE_WINDOW};
