//! Derived knowledge: embedding records, facts, and extracted insights.

use crate::packet::PacketId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored vector for one (packet, embedding model) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unique embedding id.
    pub embedding_id: String,
    /// Owning packet.
    pub packet_id: PacketId,
    /// Model identifier the vector was produced with.
    pub model: String,
    /// The vector itself.
    pub vector: Vec<f32>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// A subject-predicate-object triple. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFact {
    /// Unique fact id (empty until stored).
    #[serde(default)]
    pub id: String,
    /// Subject of the triple.
    pub subject: String,
    /// Predicate of the triple.
    pub predicate: String,
    /// Object of the triple.
    pub object: String,
    /// Confidence score (0.0 - 1.0), set by the producing rule.
    pub confidence: f32,
    /// Packet the fact was extracted from.
    pub source_packet: PacketId,
    /// When the fact was stored.
    pub created_at: DateTime<Utc>,
}

/// Category of an extracted insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    /// An explicit decision was recorded.
    Conclusion,
    /// Repeated textual or structural signatures.
    Pattern,
    /// Deviation from the segment's recent history.
    Anomaly,
    /// A suggested next action.
    Recommendation,
}

impl InsightKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightKind::Conclusion => "conclusion",
            InsightKind::Pattern => "pattern",
            InsightKind::Anomaly => "anomaly",
            InsightKind::Recommendation => "recommendation",
        }
    }
}

impl std::str::FromStr for InsightKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conclusion" => Ok(InsightKind::Conclusion),
            "pattern" => Ok(InsightKind::Pattern),
            "anomaly" => Ok(InsightKind::Anomaly),
            "recommendation" => Ok(InsightKind::Recommendation),
            other => Err(format!("unknown insight kind '{other}'")),
        }
    }
}

impl std::fmt::Display for InsightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An interpretive output derived from a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInsight {
    /// Unique insight id (empty until stored).
    #[serde(default)]
    pub id: String,
    /// Insight category.
    pub kind: InsightKind,
    /// Free-text content.
    pub content: String,
    /// Confidence score (0.0 - 1.0).
    pub confidence: f32,
    /// Packet the insight was derived from.
    pub source_packet: PacketId,
    /// When the insight was stored.
    pub created_at: DateTime<Utc>,
}

/// Output of the insight extraction engine for one packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    /// Extracted insights.
    pub insights: Vec<ExtractedInsight>,
    /// Extracted facts.
    pub facts: Vec<KnowledgeFact>,
}

impl Extraction {
    /// Whether nothing was extracted.
    pub fn is_empty(&self) -> bool {
        self.insights.is_empty() && self.facts.is_empty()
    }
}

/// Query over stored facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactQuery {
    /// Exact subject match.
    pub subject: Option<String>,
    /// Exact predicate match.
    pub predicate: Option<String>,
    /// Facts from one packet.
    pub source_packet: Option<PacketId>,
    /// Minimum confidence threshold.
    pub min_confidence: Option<f32>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

/// Query over stored insights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightQuery {
    /// Insights from one packet.
    pub packet_id: Option<PacketId>,
    /// Restrict to one kind.
    pub kind: Option<InsightKind>,
    /// Minimum confidence threshold.
    pub min_confidence: Option<f32>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insight_kind_parse() {
        assert_eq!("anomaly".parse::<InsightKind>(), Ok(InsightKind::Anomaly));
        assert!("guess".parse::<InsightKind>().is_err());
        assert_eq!(InsightKind::Recommendation.to_string(), "recommendation");
    }

    #[test]
    fn test_insight_serialization() {
        let insight = ExtractedInsight {
            id: String::new(),
            kind: InsightKind::Pattern,
            content: "repeated term 'retry'".to_string(),
            confidence: 0.6,
            source_packet: PacketId::new(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&insight).unwrap();
        assert_eq!(json["kind"], "pattern");
        let back: ExtractedInsight = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, insight.content);
    }
}
