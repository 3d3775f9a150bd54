//! Housekeeping report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-operation counts from a housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcReport {
    /// Packets removed because their TTL passed.
    pub ttl_evicted: u64,
    /// Dangling parent references removed.
    pub orphan_refs_repaired: u64,
    /// Derived packets removed after their root disappeared.
    pub parentless_removed: u64,
    /// Embedding records whose packet no longer exists.
    pub orphan_embeddings: u64,
    /// Insights whose packet no longer exists.
    pub orphan_insights: u64,
    /// Facts whose packet no longer exists.
    pub orphan_facts: u64,
    /// Tag index entries collected.
    pub tags_collected: u64,
    /// When the pass started.
    pub started_at: Option<DateTime<Utc>>,
    /// How long the pass took.
    pub duration_ms: u64,
}

impl GcReport {
    /// Total number of items touched.
    pub fn total(&self) -> u64 {
        self.ttl_evicted
            + self.orphan_refs_repaired
            + self.parentless_removed
            + self.orphan_embeddings
            + self.orphan_insights
            + self.orphan_facts
            + self.tags_collected
    }
}
