//! Retrieval request and result types.

use crate::packet::{Packet, PacketFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A packet with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPacket {
    /// The matching packet.
    pub packet: Packet,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Structured constraints for hybrid search.
///
/// Type, tag and thread constraints are evaluated against the packet store
/// before ranking; the time range and payload equality are checked on the
/// ranked candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridFilters {
    /// Match any of these types.
    pub types: Vec<String>,
    /// Require all of these tags.
    pub tags: Vec<String>,
    /// Restrict to one thread.
    pub thread_id: Option<String>,
    /// Only packets created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only packets created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Top-level payload keys that must equal the given values.
    pub payload: BTreeMap<String, Value>,
}

impl HybridFilters {
    /// The part evaluated as a store pre-filter.
    pub fn structured(&self) -> PacketFilter {
        PacketFilter {
            types: self.types.clone(),
            tags: self.tags.clone(),
            thread_id: self.thread_id.clone(),
            active_only: true,
        }
    }

    /// Whether any pre-filter constraint is set.
    pub fn is_selective(&self) -> bool {
        !self.structured().is_empty()
    }

    /// Post-filter check against a ranked candidate.
    pub fn admits(&self, packet: &Packet) -> bool {
        if self.created_after.is_some_and(|t| packet.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| packet.created_at > t) {
            return false;
        }
        self.payload
            .iter()
            .all(|(key, expected)| packet.payload.get(key) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Lifecycle, PacketId};
    use serde_json::json;

    fn packet(payload: Value) -> Packet {
        Packet {
            id: PacketId::new(),
            packet_type: "event".into(),
            payload,
            thread_id: "t".into(),
            parent_ids: vec![],
            tags: vec![],
            ttl: None,
            created_at: Utc::now(),
            sequence: 1,
            lifecycle: Lifecycle::Active,
            dedup_key: "k".into(),
        }
    }

    #[test]
    fn test_payload_equality() {
        let filters = HybridFilters {
            payload: BTreeMap::from([("action".to_string(), json!("login"))]),
            ..Default::default()
        };
        assert!(filters.admits(&packet(json!({"action": "login", "user": "ana"}))));
        assert!(!filters.admits(&packet(json!({"action": "logout"}))));
        assert!(!filters.is_selective());
    }

    #[test]
    fn test_time_range() {
        let p = packet(json!({}));
        let filters = HybridFilters {
            created_after: Some(p.created_at + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!filters.admits(&p));
        let filters = HybridFilters {
            created_before: Some(p.created_at),
            types: vec!["event".into()],
            ..Default::default()
        };
        assert!(filters.admits(&p));
        assert!(filters.is_selective());
    }
}
