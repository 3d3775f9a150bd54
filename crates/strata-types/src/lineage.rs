//! Lineage traversal types.

use crate::packet::{Packet, PacketId};
use serde::{Deserialize, Serialize};

/// Which way to walk `parent_ids` edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineageDirection {
    /// Follow child → parent edges.
    #[default]
    Ancestors,
    /// Follow parent → child edges.
    Descendants,
}

impl std::str::FromStr for LineageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ancestors" => Ok(LineageDirection::Ancestors),
            "descendants" => Ok(LineageDirection::Descendants),
            other => Err(format!(
                "invalid direction '{other}', expected ancestors|descendants"
            )),
        }
    }
}

/// A lineage edge: `child` lists `parent` in its `parent_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageEdge {
    /// The packet holding the reference.
    pub child: PacketId,
    /// The referenced packet.
    pub parent: PacketId,
}

/// The connected subgraph reachable from a packet in one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageGraph {
    /// The packet traversal started from.
    pub root: PacketId,
    /// Direction walked.
    pub direction: LineageDirection,
    /// Reachable packets in discovery order (root first).
    pub nodes: Vec<Packet>,
    /// Edges traversed.
    pub edges: Vec<LineageEdge>,
    /// Referenced ids with no stored packet (treated as leaves).
    pub missing: Vec<PacketId>,
    /// Cycles found, each as the id path that closes the loop.
    pub cycles: Vec<Vec<PacketId>>,
    /// True when `max_depth` stopped the walk early.
    pub truncated: bool,
}

impl LineageGraph {
    /// Whether the traversal found a data-integrity violation.
    pub fn has_integrity_violation(&self) -> bool {
        !self.cycles.is_empty()
    }
}
