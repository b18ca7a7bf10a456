//! Commit digest records.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// A digest of one commit, sufficient for list rendering and log output.
///
/// Commit content is immutable for a given id, so digests can be cached
/// indefinitely without an invalidation hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Full hex commit id.
    pub id: String,
    /// First line of the commit message.
    pub summary: String,
    /// Author name.
    pub author_name: String,
    /// Author email.
    pub author_email: String,
    /// Author timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl fmt::Display for CommitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.id.get(..7).unwrap_or(&self.id);
        write!(f, "{short} {} ({})", self.summary, self.author_name)
    }
}
