//! Classified repository change notifications.

use crate::change::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Names of references that differ between two reference snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefsDelta {
    /// Reference names present now but not before.
    pub added: BTreeSet<String>,
    /// Reference names present before but not now.
    pub deleted: BTreeSet<String>,
    /// Reference names whose target moved.
    pub changed: BTreeSet<String>,
}

impl RefsDelta {
    /// Whether the delta records no difference at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Advisory "something changed, re-check" signals classified from raw
/// filesystem events under a repository.
///
/// These are not exact diffs: delivery may race the operation that caused
/// the change, and over-reporting is deliberate. Consumers re-read the
/// state they care about when one arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoNotification {
    /// `HEAD` moved or now points at a different branch.
    HeadChanged,
    /// The index file was rewritten.
    IndexChanged,
    /// References were added, deleted, or retargeted.
    RefsChanged(RefsDelta),
    /// A reference log was appended or rewritten.
    RefLogChanged,
    /// The stash log changed.
    StashChanged,
    /// Paths under the working tree changed.
    WorkspaceChanged(ChangeEvent),
}

impl fmt::Display for RepoNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadChanged => f.write_str("HEAD changed"),
            Self::IndexChanged => f.write_str("index changed"),
            Self::RefsChanged(delta) => write!(
                f,
                "refs changed (+{} -{} ~{})",
                delta.added.len(),
                delta.deleted.len(),
                delta.changed.len()
            ),
            Self::RefLogChanged => f.write_str("ref log changed"),
            Self::StashChanged => f.write_str("stash changed"),
            Self::WorkspaceChanged(event) if event.rescan => {
                f.write_str("workspace changed (rescan)")
            }
            Self::WorkspaceChanged(event) => {
                write!(f, "workspace changed ({} paths)", event.paths.len())
            }
        }
    }
}
