//! Domain types shared across the git-berth workspace.
//!
//! This crate is free of git and I/O concerns: it defines the change and
//! notification vocabulary the watchers speak, the commit digest record the
//! backend caches, and the position cache that keeps history lookups cheap
//! while the underlying history is being rewritten.

/// Coalesced filesystem change batches.
pub mod change;
/// Commit digest records.
pub mod commit;
/// Classified repository change notifications.
pub mod notification;
/// Position lookup cache with watermark-based invalidation.
pub mod position_cache;

pub use change::ChangeEvent;
pub use commit::CommitSummary;
pub use notification::{RefsDelta, RepoNotification};
pub use position_cache::PositionCache;
