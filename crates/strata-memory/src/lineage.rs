//! Lineage traversal over `parent_ids` edges.
//!
//! The walk is a depth-first search over an explicit stack of frames, one
//! per node on the current path, so chain length never touches the thread
//! stack. Reaching a
//! node already on the path records a cycle and stops that branch; a
//! referenced id with no stored packet is recorded as missing and treated as
//! a leaf. Every node is expanded at most once, so the walk terminates on any
//! stored graph.

use crate::packet_store::PacketStore;
use std::collections::HashSet;
use strata_types::error::{StrataError, StrataResult};
use strata_types::lineage::{LineageDirection, LineageEdge, LineageGraph};
use strata_types::packet::{Packet, PacketId};
use tracing::warn;

/// Hard ceiling on traversal depth.
pub const MAX_LINEAGE_DEPTH: usize = 1024;

/// Walks the lineage relation of the packet store.
#[derive(Clone)]
pub struct LineageTracer {
    packets: PacketStore,
}

struct Walk {
    direction: LineageDirection,
    max_depth: usize,
    graph: LineageGraph,
    visited: HashSet<PacketId>,
    edges_seen: HashSet<LineageEdge>,
    path: Vec<PacketId>,
    on_path: HashSet<PacketId>,
}

/// A node on the current path and the neighbours it has left to explore.
struct Frame {
    id: PacketId,
    depth: usize,
    pending: std::vec::IntoIter<PacketId>,
}

impl LineageTracer {
    /// Create a tracer over the given store.
    pub fn new(packets: PacketStore) -> Self {
        Self { packets }
    }

    /// The connected subgraph reachable from `root` in `direction`.
    ///
    /// Fails with `NotFound` only when `root` itself is absent.
    pub fn trace(
        &self,
        root: PacketId,
        direction: LineageDirection,
        max_depth: Option<usize>,
    ) -> StrataResult<LineageGraph> {
        let root_packet = self
            .packets
            .get(root)?
            .ok_or_else(|| StrataError::NotFound(format!("packet {root}")))?;

        let mut walk = Walk {
            direction,
            max_depth: max_depth.unwrap_or(MAX_LINEAGE_DEPTH).min(MAX_LINEAGE_DEPTH),
            graph: LineageGraph {
                root,
                direction,
                nodes: Vec::new(),
                edges: Vec::new(),
                missing: Vec::new(),
                cycles: Vec::new(),
                truncated: false,
            },
            visited: HashSet::from([root]),
            edges_seen: HashSet::new(),
            path: Vec::new(),
            on_path: HashSet::new(),
        };
        walk.graph.nodes.push(root_packet.clone());
        self.walk_from(&mut walk, &root_packet)?;

        if walk.graph.has_integrity_violation() {
            warn!(
                packet_id = %root,
                cycles = walk.graph.cycles.len(),
                "Lineage cycle found during traversal"
            );
        }
        Ok(walk.graph)
    }

    fn neighbours(&self, direction: LineageDirection, packet: &Packet) -> StrataResult<Vec<PacketId>> {
        match direction {
            LineageDirection::Ancestors => Ok(packet.parent_ids.clone()),
            LineageDirection::Descendants => self.packets.children_of(packet.id),
        }
    }

    fn walk_from(&self, walk: &mut Walk, root: &Packet) -> StrataResult<()> {
        let mut stack = Vec::new();
        self.enter(walk, &mut stack, root, 0)?;

        while let Some(frame) = stack.last_mut() {
            let Some(next) = frame.pending.next() else {
                let done = frame.id;
                stack.pop();
                walk.path.pop();
                walk.on_path.remove(&done);
                continue;
            };
            let (current, depth) = (frame.id, frame.depth);

            let edge = match walk.direction {
                LineageDirection::Ancestors => LineageEdge {
                    child: current,
                    parent: next,
                },
                LineageDirection::Descendants => LineageEdge {
                    child: next,
                    parent: current,
                },
            };
            if walk.edges_seen.insert(edge) {
                walk.graph.edges.push(edge);
            }

            if walk.on_path.contains(&next) {
                if let Some(pos) = walk.path.iter().position(|id| *id == next) {
                    let mut cycle = walk.path[pos..].to_vec();
                    cycle.push(next);
                    walk.graph.cycles.push(cycle);
                }
                continue;
            }
            if walk.visited.contains(&next) {
                continue;
            }
            if depth + 1 > walk.max_depth {
                walk.graph.truncated = true;
                continue;
            }
            walk.visited.insert(next);
            match self.packets.get(next)? {
                Some(found) => {
                    walk.graph.nodes.push(found.clone());
                    self.enter(walk, &mut stack, &found, depth + 1)?;
                }
                None => walk.graph.missing.push(next),
            }
        }
        Ok(())
    }

    fn enter(
        &self,
        walk: &mut Walk,
        stack: &mut Vec<Frame>,
        packet: &Packet,
        depth: usize,
    ) -> StrataResult<()> {
        let pending = self.neighbours(walk.direction, packet)?.into_iter();
        walk.path.push(packet.id);
        walk.on_path.insert(packet.id);
        stack.push(Frame {
            id: packet.id,
            depth,
            pending,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use strata_types::packet::NewPacket;

    fn setup() -> (Arc<Mutex<Connection>>, PacketStore, LineageTracer) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let store = PacketStore::new(conn.clone()).with_dangling_parents(true);
        (conn, store.clone(), LineageTracer::new(store))
    }

    fn write(store: &PacketStore, name: &str, parents: Vec<PacketId>) -> PacketId {
        store
            .write(NewPacket::new("event", json!({ "name": name })).with_parents(parents))
            .unwrap()
            .id
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let (_, store, tracer) = setup();
        let a = write(&store, "a", vec![]);
        let b = write(&store, "b", vec![a]);
        let c = write(&store, "c", vec![b]);

        let up = tracer.trace(c, LineageDirection::Ancestors, None).unwrap();
        let ids: Vec<PacketId> = up.nodes.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![c, b, a]);
        assert_eq!(up.edges.len(), 2);
        assert!(!up.has_integrity_violation());

        let down = tracer.trace(a, LineageDirection::Descendants, None).unwrap();
        let ids: Vec<PacketId> = down.nodes.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_diamond_visits_each_node_once() {
        let (_, store, tracer) = setup();
        let root = write(&store, "root", vec![]);
        let left = write(&store, "left", vec![root]);
        let right = write(&store, "right", vec![root]);
        let join = write(&store, "join", vec![left, right]);

        let up = tracer.trace(join, LineageDirection::Ancestors, None).unwrap();
        assert_eq!(up.nodes.len(), 4);
        assert_eq!(up.edges.len(), 4);
        assert!(up.cycles.is_empty());
    }

    #[test]
    fn test_missing_parent_is_a_leaf() {
        let (_, store, tracer) = setup();
        let ghost = PacketId::new();
        let child = write(&store, "child", vec![ghost]);
        let graph = tracer.trace(child, LineageDirection::Ancestors, None).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.missing, vec![ghost]);
    }

    #[test]
    fn test_cycle_reported_not_looped() {
        let (conn, store, tracer) = setup();
        let a = write(&store, "a", vec![]);
        let b = write(&store, "b", vec![a]);
        // Close a -> b -> a behind the store's back, as legacy data might.
        {
            let conn = conn.lock().unwrap();
            conn.execute(
                "UPDATE packets SET parent_ids = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&vec![b]).unwrap(), a.to_string()],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO lineage_edges (child_id, parent_id, position) VALUES (?1, ?2, 0)",
                rusqlite::params![a.to_string(), b.to_string()],
            )
            .unwrap();
        }

        let up = tracer.trace(b, LineageDirection::Ancestors, None).unwrap();
        assert!(up.has_integrity_violation());
        assert_eq!(up.cycles, vec![vec![b, a, b]]);
        assert_eq!(up.nodes.len(), 2);

        let down = tracer.trace(a, LineageDirection::Descendants, None).unwrap();
        assert!(down.has_integrity_violation());
    }

    #[test]
    fn test_chain_longer_than_depth_ceiling() {
        let (_, store, tracer) = setup();
        let root = write(&store, "n0", vec![]);
        let mut prev = root;
        for n in 1..1100 {
            prev = write(&store, &format!("n{n}"), vec![prev]);
        }

        let down = tracer.trace(root, LineageDirection::Descendants, None).unwrap();
        assert_eq!(down.nodes.len(), MAX_LINEAGE_DEPTH + 1);
        assert!(down.truncated);
        assert!(down.cycles.is_empty());

        let up = tracer.trace(prev, LineageDirection::Ancestors, Some(2000)).unwrap();
        assert_eq!(up.nodes.len(), MAX_LINEAGE_DEPTH + 1);
        assert!(up.truncated);
    }

    #[test]
    fn test_max_depth_truncates() {
        let (_, store, tracer) = setup();
        let a = write(&store, "a", vec![]);
        let b = write(&store, "b", vec![a]);
        let c = write(&store, "c", vec![b]);
        let graph = tracer.trace(c, LineageDirection::Ancestors, Some(1)).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.truncated);
    }

    #[test]
    fn test_missing_root() {
        let (_, _, tracer) = setup();
        let err = tracer
            .trace(PacketId::new(), LineageDirection::Ancestors, None)
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }
}
