//! Ingestion pipeline types: stages, outcomes, and notifications.

use crate::knowledge::Extraction;
use crate::packet::{Packet, PacketId};
use serde::{Deserialize, Serialize};

/// Ingestion stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Structural validation, default-filling, dedup key.
    Intake,
    /// Derive the reasoning annotation.
    Reasoning,
    /// Durable persist (commit point).
    MemoryWrite,
    /// Compute and store an embedding.
    SemanticEmbed,
    /// Run the insight extraction engine.
    ExtractInsights,
    /// Persist facts and insights.
    StoreInsights,
    /// Best-effort external notification.
    WorldModelTrigger,
    /// Sampled housekeeping trigger.
    GcTrigger,
    /// Mark the run complete.
    Checkpoint,
}

impl Stage {
    /// All stages in order.
    pub const ALL: [Stage; 9] = [
        Stage::Intake,
        Stage::Reasoning,
        Stage::MemoryWrite,
        Stage::SemanticEmbed,
        Stage::ExtractInsights,
        Stage::StoreInsights,
        Stage::WorldModelTrigger,
        Stage::GcTrigger,
        Stage::Checkpoint,
    ];

    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Reasoning => "reasoning",
            Stage::MemoryWrite => "memory_write",
            Stage::SemanticEmbed => "semantic_embed",
            Stage::ExtractInsights => "extract_insights",
            Stage::StoreInsights => "store_insights",
            Stage::WorldModelTrigger => "world_model_trigger",
            Stage::GcTrigger => "gc_trigger",
            Stage::Checkpoint => "checkpoint",
        }
    }

    /// Parse a stable name.
    pub fn parse(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    /// The stage after this one, if any.
    pub fn next(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    /// Whether a failure in this stage aborts the ingestion.
    pub fn is_durability_path(&self) -> bool {
        matches!(self, Stage::Intake | Stage::Reasoning | Stage::MemoryWrite)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller gets back from an ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// Packet id (the original one on a duplicate).
    pub id: PacketId,
    /// Thread the packet belongs to.
    pub thread_id: String,
    /// Per-thread sequence number.
    pub sequence: u64,
    /// True when the dedup key matched an existing packet.
    pub duplicate: bool,
    /// Enrichment stages that failed and were deferred to reconciliation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<Stage>,
}

/// Counts from a reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Incomplete pipelines resumed to completion.
    pub resumed: u64,
    /// Failed enrichment stages that succeeded on retry.
    pub retried: u64,
    /// Packets embedded for the current model.
    pub embedded: u64,
    /// Items still failing after this sweep.
    pub still_failing: u64,
}

/// Notification sent to the world-model collaborator after extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModelEvent {
    /// The ingested packet.
    pub packet: Packet,
    /// What was extracted from it.
    pub extraction: Extraction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Intake < Stage::MemoryWrite);
        assert!(Stage::MemoryWrite < Stage::SemanticEmbed);
        assert_eq!(Stage::MemoryWrite.next(), Some(Stage::SemanticEmbed));
        assert_eq!(Stage::Checkpoint.next(), None);
    }

    #[test]
    fn test_stage_names_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_durability_path() {
        assert!(Stage::MemoryWrite.is_durability_path());
        assert!(!Stage::SemanticEmbed.is_durability_path());
        assert!(!Stage::WorldModelTrigger.is_durability_path());
    }
}
