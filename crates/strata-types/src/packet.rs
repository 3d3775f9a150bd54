//! Packet types: the unit of record, its write input, and its reasoning annotation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(pub Uuid);

impl PacketId {
    /// Create a new random PacketId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PacketId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PacketId)
    }
}

/// Lifecycle state of a stored packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Live and eligible for search.
    #[default]
    Active,
    /// TTL has passed; awaiting eviction.
    Expired,
    /// Removed by housekeeping (only ever seen on tombstones).
    Evicted,
}

impl Lifecycle {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Expired => "expired",
            Lifecycle::Evicted => "evicted",
        }
    }

    /// Parse the storage representation, defaulting to `Active`.
    pub fn parse(s: &str) -> Self {
        match s {
            "expired" => Lifecycle::Expired,
            "evicted" => Lifecycle::Evicted,
            _ => Lifecycle::Active,
        }
    }
}

/// Caller-supplied packet fields, before validation and default-filling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPacket {
    /// Optional caller-chosen id; assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PacketId>,
    /// Free-form category ("event", "insight", "analysis", ...).
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Arbitrary structured content.
    #[serde(default)]
    pub payload: Value,
    /// Conversation/episode grouping key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Ordered ancestor ids.
    #[serde(default)]
    pub parent_ids: Vec<PacketId>,
    /// Tag set.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Absolute expiry instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<DateTime<Utc>>,
    /// Optional caller-chosen deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl NewPacket {
    /// Convenience constructor for the common case.
    pub fn new(packet_type: impl Into<String>, payload: Value) -> Self {
        Self {
            packet_type: packet_type.into(),
            payload,
            ..Default::default()
        }
    }

    /// Set the thread id.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the parent ids.
    pub fn with_parents(mut self, parents: Vec<PacketId>) -> Self {
        self.parent_ids = parents;
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the absolute expiry instant.
    pub fn expires_at(mut self, ttl: DateTime<Utc>) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Content-derived deduplication key.
    ///
    /// SHA-256 over the canonical JSON of type, payload, thread, parents and
    /// the normalised tag set. `serde_json` objects are key-ordered, so equal
    /// content always hashes equally. `ttl` is not part of packet identity.
    pub fn content_key(&self) -> String {
        let identity = serde_json::json!({
            "type": self.packet_type,
            "payload": self.payload,
            "thread_id": self.thread_id,
            "parent_ids": self.parent_ids,
            "tags": normalize_tags(&self.tags),
        });
        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Trim, lower-case, de-duplicate and sort a tag list.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// A stored packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Globally unique, immutable id.
    pub id: PacketId,
    /// Free-form category.
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Arbitrary structured content.
    pub payload: Value,
    /// Conversation/episode grouping key.
    pub thread_id: String,
    /// Ordered ancestor ids (may include dangling references until repaired).
    pub parent_ids: Vec<PacketId>,
    /// Normalised tag set.
    pub tags: Vec<String>,
    /// Absolute expiry instant.
    pub ttl: Option<DateTime<Utc>>,
    /// Assignment time.
    pub created_at: DateTime<Utc>,
    /// Per-thread monotonic sequence number (1-based).
    pub sequence: u64,
    /// Lifecycle state.
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Deduplication key the packet was written under.
    pub dedup_key: String,
}

impl Packet {
    /// Text used for embedding and textual rule matching.
    ///
    /// Payload leaves in key order, joined by spaces. Keys are structure, not
    /// content, and are not included. Falls back to the packet type.
    pub fn embedding_text(&self) -> String {
        let text = payload_text(&self.payload);
        if text.is_empty() {
            self.packet_type.clone()
        } else {
            text
        }
    }

    /// Whether the TTL has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl.map(|t| t <= now).unwrap_or(false)
    }
}

/// Flatten the leaves of a payload into a single space-separated string.
pub fn payload_text(payload: &Value) -> String {
    let mut parts = Vec::new();
    collect_leaves(payload, &mut parts);
    parts.join(" ")
}

fn collect_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(b.to_string()),
        Value::Number(n) => out.push(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
    }
}

/// Result of a packet write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    /// The id of the stored packet (the original one on a duplicate).
    pub id: PacketId,
    /// Thread the packet belongs to.
    pub thread_id: String,
    /// Per-thread sequence number of the stored packet.
    pub sequence: u64,
    /// True when the dedup key matched an existing packet.
    pub duplicate: bool,
}

/// Deterministic annotation derived from packet content during ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningAnnotation {
    /// Short digest of the packet's text.
    pub summary: String,
    /// Most frequent tokens, most frequent first.
    pub keywords: Vec<String>,
    /// Explicit decisions found in the packet.
    pub decision_tokens: Vec<String>,
    /// Top-level numeric payload fields.
    pub numeric_fields: BTreeMap<String, f64>,
    /// Top-level short string payload fields.
    pub categorical_fields: BTreeMap<String, String>,
    /// Segment used for anomaly history.
    pub segment: String,
    /// Length in characters of the packet's text.
    pub text_length: usize,
}

/// Structured pre-filter over the packet store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketFilter {
    /// Match any of these types.
    #[serde(default)]
    pub types: Vec<String>,
    /// Require all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Restrict to a single thread.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Only active packets.
    #[serde(default)]
    pub active_only: bool,
}

impl PacketFilter {
    /// Whether the filter constrains anything.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.tags.is_empty() && self.thread_id.is_none()
    }
}
