//! Coalesced filesystem change batches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// A debounced batch of filesystem paths observed to have changed under a
/// watched root.
///
/// One event may stand for many physical writes. When `rescan` is set the
/// watch facility lost track of individual paths (event queue overflow,
/// watch revoked) and `paths` holds the watched root itself: everything
/// beneath it may have changed. Consumers must treat that case as a full
/// re-check, never as "nothing happened".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Absolute paths affected by this batch.
    pub paths: BTreeSet<PathBuf>,
    /// Whether this batch stands for "anything under the root".
    pub rescan: bool,
    /// When the batch was assembled.
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl ChangeEvent {
    /// Batch of specific changed paths.
    #[must_use]
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            rescan: false,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    /// Batch standing for "anything under `root` may have changed".
    #[must_use]
    pub fn rescan(root: PathBuf) -> Self {
        Self {
            paths: BTreeSet::from([root]),
            rescan: true,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    /// Whether the batch carries no paths at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Whether any path in the batch lies under `prefix`, or the batch is a
    /// rescan (which may cover anything).
    #[must_use]
    pub fn touches(&self, prefix: &Path) -> bool {
        self.rescan || self.paths.iter().any(|path| path.starts_with(prefix))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rescan_carries_the_root() {
        let event = ChangeEvent::rescan(PathBuf::from("/repo"));
        assert!(event.rescan);
        assert_eq!(event.paths.len(), 1);
        assert!(event.paths.contains(Path::new("/repo")));
    }

    #[test]
    fn touches_matches_prefixes() {
        let event = ChangeEvent::new([PathBuf::from("/repo/src/main.rs")]);
        assert!(event.touches(Path::new("/repo/src")));
        assert!(event.touches(Path::new("/repo")));
        assert!(!event.touches(Path::new("/repo/docs")));
    }

    #[test]
    fn rescan_touches_everything() {
        let event = ChangeEvent::rescan(PathBuf::from("/repo"));
        assert!(event.touches(Path::new("/repo/anything/at/all")));
    }

    #[test]
    fn serializes_with_rfc3339_timestamp() {
        let event = ChangeEvent::new([PathBuf::from("/repo/file")]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"observed_at\""));
        // RFC 3339 values carry a date separator and a timezone marker.
        assert!(json.contains('T') && (json.contains('Z') || json.contains('+')));
    }
}
