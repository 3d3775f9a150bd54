//! SQLite packet store: the canonical, append-oriented ledger.
//!
//! Writes are idempotent on the dedup key and commit the packet, its lineage
//! edges, its tags, the per-thread sequence increment and (optionally) its
//! reasoning annotation and pipeline checkpoint in a single transaction.

use crate::{db_err, fmt_ts, lock_err, parse_ts};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use strata_types::config::IngestionConfig;
use strata_types::error::{StrataError, StrataResult};
use strata_types::packet::{
    normalize_tags, Lifecycle, NewPacket, Packet, PacketFilter, PacketId, ReasoningAnnotation,
    WriteResult,
};
use strata_types::pipeline::Stage;
use tracing::debug;

const MAX_TYPE_LEN: usize = 64;
const MAX_TAGS: usize = 32;
const MAX_TAG_LEN: usize = 64;
const MAX_PARENTS: usize = 64;

pub(crate) const PACKET_COLUMNS: &str = "id, packet_type, payload, thread_id, parent_ids, tags, ttl, created_at, sequence, lifecycle, dedup_key";

/// A validated, default-filled packet ready for the durable write.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPacket {
    /// Assigned or caller-supplied id.
    pub id: PacketId,
    /// Packet type.
    pub packet_type: String,
    /// Payload.
    pub payload: serde_json::Value,
    /// Thread (defaults to the packet's own id).
    pub thread_id: String,
    /// De-duplicated parents, order preserved.
    pub parent_ids: Vec<PacketId>,
    /// Normalised tags.
    pub tags: Vec<String>,
    /// Expiry.
    pub ttl: Option<DateTime<Utc>>,
    /// Deduplication key.
    pub dedup_key: String,
}

/// Validate a caller packet, compute its dedup key and fill defaults.
pub fn prepare(new: NewPacket, config: &IngestionConfig) -> StrataResult<PreparedPacket> {
    let packet_type = new.packet_type.trim().to_string();
    if packet_type.is_empty() {
        return Err(StrataError::Validation("type must not be empty".to_string()));
    }
    if packet_type.len() > MAX_TYPE_LEN {
        return Err(StrataError::Validation(format!(
            "type exceeds {MAX_TYPE_LEN} characters"
        )));
    }
    if !packet_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(StrataError::Validation(format!(
            "type '{packet_type}' contains invalid characters"
        )));
    }
    if new.payload.is_null() {
        return Err(StrataError::Validation("payload is required".to_string()));
    }
    let payload_len = serde_json::to_vec(&new.payload)?.len();
    if payload_len > config.max_payload_bytes {
        return Err(StrataError::Validation(format!(
            "payload is {payload_len} bytes, limit is {}",
            config.max_payload_bytes
        )));
    }
    if new.tags.len() > MAX_TAGS {
        return Err(StrataError::Validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    if let Some(tag) = new.tags.iter().find(|t| t.trim().len() > MAX_TAG_LEN) {
        return Err(StrataError::Validation(format!(
            "tag '{tag}' exceeds {MAX_TAG_LEN} characters"
        )));
    }
    if new.parent_ids.len() > MAX_PARENTS {
        return Err(StrataError::Validation(format!(
            "at most {MAX_PARENTS} parents are allowed"
        )));
    }
    if let Some(thread) = &new.thread_id {
        if thread.trim().is_empty() {
            return Err(StrataError::Validation(
                "thread_id must not be blank".to_string(),
            ));
        }
    }

    // Identity is computed on the caller's content, before defaults.
    let dedup_key = match &new.dedup_key {
        Some(k) if !k.trim().is_empty() => k.trim().to_string(),
        _ => new.content_key(),
    };

    let id = new.id.unwrap_or_default();
    let mut parent_ids = Vec::with_capacity(new.parent_ids.len());
    for parent in new.parent_ids {
        if parent == id {
            return Err(StrataError::Validation(
                "a packet cannot be its own parent".to_string(),
            ));
        }
        if !parent_ids.contains(&parent) {
            parent_ids.push(parent);
        }
    }

    Ok(PreparedPacket {
        id,
        packet_type,
        payload: new.payload,
        thread_id: new
            .thread_id
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| id.to_string()),
        parent_ids,
        tags: normalize_tags(&new.tags),
        ttl: new.ttl,
        dedup_key,
    })
}

/// Packet store backed by SQLite.
#[derive(Clone)]
pub struct PacketStore {
    conn: Arc<Mutex<Connection>>,
    allow_dangling_parents: bool,
}

impl PacketStore {
    /// Create a new packet store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            allow_dangling_parents: false,
        }
    }

    /// Accept parent ids that do not exist at write time.
    pub fn with_dangling_parents(mut self, allow: bool) -> Self {
        self.allow_dangling_parents = allow;
        self
    }

    /// Validate and write a caller packet (no annotation, no checkpoint).
    pub fn write(&self, new: NewPacket) -> StrataResult<WriteResult> {
        let prepared = prepare(new, &IngestionConfig::default())?;
        self.write_prepared(&prepared, None, false)
    }

    /// Durable write of a prepared packet.
    ///
    /// A matching dedup key returns the original packet with `duplicate = true`
    /// and writes nothing. Otherwise the packet, its edges and tags, the
    /// thread counter, the annotation and (when `checkpoint` is set) a
    /// `memory_write` checkpoint commit atomically.
    pub fn write_prepared(
        &self,
        packet: &PreparedPacket,
        annotation: Option<&ReasoningAnnotation>,
        checkpoint: bool,
    ) -> StrataResult<WriteResult> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT id, thread_id, sequence FROM packets WHERE dedup_key = ?1",
                rusqlite::params![packet.dedup_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        if let Some((id_str, thread_id, sequence)) = existing {
            let id = parse_id(&id_str)?;
            debug!(packet_id = %id, "Duplicate write matched existing packet");
            return Ok(WriteResult {
                id,
                thread_id,
                sequence: sequence as u64,
                duplicate: true,
            });
        }

        let id_str = packet.id.to_string();
        if packet_exists(&tx, &id_str)? {
            return Err(StrataError::Validation(format!(
                "packet id {id_str} already exists with different content"
            )));
        }

        for parent in &packet.parent_ids {
            let parent_str = parent.to_string();
            if !self.allow_dangling_parents && !packet_exists(&tx, &parent_str)? {
                return Err(StrataError::Validation(format!(
                    "parent {parent_str} does not exist"
                )));
            }
            if reaches_ancestor(&tx, &parent_str, &id_str)? {
                return Err(StrataError::LineageIntegrity(format!(
                    "writing {id_str} under {parent_str} would create a lineage cycle"
                )));
            }
        }

        tx.execute(
            "INSERT INTO thread_sequences (thread_id, last_seq) VALUES (?1, 1)
             ON CONFLICT(thread_id) DO UPDATE SET last_seq = last_seq + 1",
            rusqlite::params![packet.thread_id],
        )
        .map_err(db_err)?;
        let sequence: i64 = tx
            .query_row(
                "SELECT last_seq FROM thread_sequences WHERE thread_id = ?1",
                rusqlite::params![packet.thread_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let now = fmt_ts(Utc::now());
        tx.execute(
            "INSERT INTO packets (id, packet_type, payload, thread_id, parent_ids, tags, ttl, created_at, sequence, dedup_key, lifecycle, origin_parent_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'active', ?11)",
            rusqlite::params![
                id_str,
                packet.packet_type,
                serde_json::to_string(&packet.payload)?,
                packet.thread_id,
                serde_json::to_string(&packet.parent_ids)?,
                serde_json::to_string(&packet.tags)?,
                packet.ttl.map(fmt_ts),
                now,
                sequence,
                packet.dedup_key,
                packet.parent_ids.len() as i64,
            ],
        )
        .map_err(db_err)?;

        for (position, parent) in packet.parent_ids.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO lineage_edges (child_id, parent_id, position) VALUES (?1, ?2, ?3)",
                rusqlite::params![id_str, parent.to_string(), position as i64],
            )
            .map_err(db_err)?;
        }

        for tag in &packet.tags {
            tx.execute(
                "INSERT OR IGNORE INTO packet_tags (packet_id, tag) VALUES (?1, ?2)",
                rusqlite::params![id_str, tag],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT INTO tag_index (tag, usage_count, last_used_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(tag) DO UPDATE SET usage_count = usage_count + 1, last_used_at = ?2",
                rusqlite::params![tag, now],
            )
            .map_err(db_err)?;
        }

        if let Some(annotation) = annotation {
            tx.execute(
                "INSERT OR REPLACE INTO annotations (packet_id, segment, annotation, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id_str,
                    annotation.segment,
                    serde_json::to_string(annotation)?,
                    now
                ],
            )
            .map_err(db_err)?;
        }

        if checkpoint {
            tx.execute(
                "INSERT OR REPLACE INTO pipeline_checkpoints (packet_id, last_stage, completed, attempts, updated_at, failed_stages)
                 VALUES (?1, ?2, 0, 1, ?3, '[]')",
                rusqlite::params![id_str, Stage::MemoryWrite.as_str(), now],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        debug!(packet_id = %packet.id, thread = %packet.thread_id, sequence, "Packet committed");

        Ok(WriteResult {
            id: packet.id,
            thread_id: packet.thread_id.clone(),
            sequence: sequence as u64,
            duplicate: false,
        })
    }

    /// Read a packet by id.
    pub fn read(&self, id: PacketId) -> StrataResult<Packet> {
        self.get(id)?
            .ok_or_else(|| StrataError::NotFound(format!("packet {id}")))
    }

    /// Read a packet by id, `None` when absent.
    pub fn get(&self, id: PacketId) -> StrataResult<Option<Packet>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let sql = format!("SELECT {PACKET_COLUMNS} FROM packets WHERE id = ?1");
        conn.query_row(&sql, rusqlite::params![id.to_string()], row_to_packet)
            .optional()
            .map_err(db_err)?
            .transpose()
    }

    /// Read several packets, silently skipping missing ids. Order follows `ids`.
    pub fn read_many(&self, ids: &[PacketId]) -> StrataResult<Vec<Packet>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(packet) = self.get(*id)? {
                out.push(packet);
            }
        }
        Ok(out)
    }

    /// Whether a packet exists.
    pub fn exists(&self, id: PacketId) -> StrataResult<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        packet_exists(&conn, &id.to_string())
    }

    /// All packets in a thread, ordered by the per-thread sequence counter.
    pub fn fetch_thread(&self, thread_id: &str) -> StrataResult<Vec<Packet>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let sql = format!(
            "SELECT {PACKET_COLUMNS} FROM packets WHERE thread_id = ?1 ORDER BY sequence ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![thread_id], row_to_packet)
            .map_err(db_err)?;
        let mut packets = Vec::new();
        for row in rows {
            packets.push(row.map_err(db_err)??);
        }
        Ok(packets)
    }

    /// Ids matching a structured pre-filter (type, tags, thread), newest first.
    pub fn ids_matching(&self, filter: &PacketFilter, limit: usize) -> StrataResult<Vec<PacketId>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut sql = String::from("SELECT p.id FROM packets p WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1;

        if !filter.types.is_empty() {
            let placeholders: Vec<String> = filter
                .types
                .iter()
                .map(|t| {
                    params.push(Box::new(t.clone()));
                    let p = format!("?{idx}");
                    idx += 1;
                    p
                })
                .collect();
            sql.push_str(&format!(" AND p.packet_type IN ({})", placeholders.join(", ")));
        }
        let tags = normalize_tags(&filter.tags);
        if !tags.is_empty() {
            let placeholders: Vec<String> = tags
                .iter()
                .map(|t| {
                    params.push(Box::new(t.clone()));
                    let p = format!("?{idx}");
                    idx += 1;
                    p
                })
                .collect();
            sql.push_str(&format!(
                " AND (SELECT COUNT(*) FROM packet_tags pt WHERE pt.packet_id = p.id AND pt.tag IN ({})) = {}",
                placeholders.join(", "),
                tags.len()
            ));
        }
        if let Some(ref thread) = filter.thread_id {
            sql.push_str(&format!(" AND p.thread_id = ?{idx}"));
            params.push(Box::new(thread.clone()));
        }
        if filter.active_only {
            sql.push_str(" AND p.lifecycle = 'active'");
        }
        sql.push_str(&format!(" ORDER BY p.created_at DESC, p.rowid DESC LIMIT {limit}"));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_id(&row.map_err(db_err)?)?);
        }
        Ok(ids)
    }

    /// The stored reasoning annotation for a packet.
    pub fn annotation(&self, id: PacketId) -> StrataResult<Option<ReasoningAnnotation>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT annotation FROM annotations WHERE packet_id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Annotations of up to `limit` packets in `segment` written before `id`,
    /// most recent first. This is the anomaly history window.
    pub fn recent_in_segment(
        &self,
        segment: &str,
        id: PacketId,
        limit: usize,
    ) -> StrataResult<Vec<ReasoningAnnotation>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT a.annotation FROM annotations a
                 JOIN packets p ON p.id = a.packet_id
                 WHERE a.segment = ?1
                   AND p.rowid < COALESCE((SELECT rowid FROM packets WHERE id = ?2), 9223372036854775807)
                 ORDER BY p.rowid DESC
                 LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![segment, id.to_string(), limit as i64],
                |row| row.get::<_, String>(0),
            )
            .map_err(db_err)?;
        let mut history = Vec::new();
        for row in rows {
            let raw = row.map_err(db_err)?;
            match serde_json::from_str(&raw) {
                Ok(a) => history.push(a),
                Err(e) => tracing::warn!("Skipping unreadable annotation: {e}"),
            }
        }
        Ok(history)
    }

    /// Ids of packets that list `id` as a parent.
    pub fn children_of(&self, id: PacketId) -> StrataResult<Vec<PacketId>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare("SELECT child_id FROM lineage_edges WHERE parent_id = ?1 ORDER BY child_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_id(&row.map_err(db_err)?)?);
        }
        Ok(ids)
    }

    /// Number of stored packets.
    pub fn count(&self) -> StrataResult<u64> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }

    /// Number of packets in a thread.
    pub fn thread_len(&self, thread_id: &str) -> StrataResult<u64> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM packets WHERE thread_id = ?1",
                rusqlite::params![thread_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as u64)
    }

    /// Whether `id` was removed by housekeeping.
    pub fn was_evicted(&self, id: PacketId) -> StrataResult<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            "SELECT 1 FROM evictions WHERE packet_id = ?1",
            rusqlite::params![id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
        .map_err(db_err)
    }

    /// Delete `root` and every descendant whose parents all lie inside the
    /// deleted set. Housekeeping only; ordinary callers never delete.
    pub(crate) fn delete_subtree(&self, root: PacketId, reason: &str) -> StrataResult<usize> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        let root_str = root.to_string();
        if !packet_exists(&tx, &root_str)? {
            return Ok(0);
        }

        let mut doomed: Vec<String> = vec![root_str.clone()];
        let mut doomed_set: HashSet<String> = HashSet::from([root_str.clone()]);
        let mut queue: VecDeque<String> = VecDeque::from([root_str]);
        while let Some(current) = queue.pop_front() {
            for child in child_ids(&tx, &current)? {
                if doomed_set.contains(&child) {
                    continue;
                }
                let parents = parent_ids_of(&tx, &child)?;
                if parents.iter().all(|p| doomed_set.contains(p)) {
                    doomed_set.insert(child.clone());
                    doomed.push(child.clone());
                    queue.push_back(child);
                }
            }
        }

        let removed = delete_packets(&tx, &doomed, reason, Utc::now())?;
        tx.commit().map_err(db_err)?;
        Ok(removed)
    }
}

/// Parse one row selected with `PACKET_COLUMNS`.
pub(crate) fn row_to_packet(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrataResult<Packet>> {
    let id_str: String = row.get(0)?;
    let packet_type: String = row.get(1)?;
    let payload_str: String = row.get(2)?;
    let thread_id: String = row.get(3)?;
    let parents_str: String = row.get(4)?;
    let tags_str: String = row.get(5)?;
    let ttl_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let sequence: i64 = row.get(8)?;
    let lifecycle: String = row.get(9)?;
    let dedup_key: String = row.get(10)?;

    let build = || -> StrataResult<Packet> {
        Ok(Packet {
            id: parse_id(&id_str)?,
            packet_type,
            payload: serde_json::from_str(&payload_str)?,
            thread_id,
            parent_ids: serde_json::from_str(&parents_str)?,
            tags: serde_json::from_str(&tags_str)?,
            ttl: ttl_str.as_deref().map(parse_ts),
            created_at: parse_ts(&created_str),
            sequence: sequence as u64,
            lifecycle: Lifecycle::parse(&lifecycle),
            dedup_key,
        })
    };
    Ok(build())
}

pub(crate) fn parse_id(s: &str) -> StrataResult<PacketId> {
    s.parse::<PacketId>()
        .map_err(|e| StrataError::Serialization(format!("bad packet id '{s}': {e}")))
}

pub(crate) fn packet_exists(conn: &Connection, id: &str) -> StrataResult<bool> {
    conn.query_row(
        "SELECT 1 FROM packets WHERE id = ?1",
        rusqlite::params![id],
        |_| Ok(()),
    )
    .optional()
    .map(|r| r.is_some())
    .map_err(db_err)
}

/// Whether `target` is `start` or one of its stored ancestors.
/// `UNION` de-duplicates, so the walk terminates on cyclic data.
fn reaches_ancestor(conn: &Connection, start: &str, target: &str) -> StrataResult<bool> {
    conn.query_row(
        "WITH RECURSIVE anc(id) AS (
             SELECT ?1
             UNION
             SELECT e.parent_id FROM lineage_edges e JOIN anc ON e.child_id = anc.id
         )
         SELECT 1 FROM anc WHERE id = ?2 LIMIT 1",
        rusqlite::params![start, target],
        |_| Ok(()),
    )
    .optional()
    .map(|r| r.is_some())
    .map_err(db_err)
}

fn child_ids(conn: &Connection, id: &str) -> StrataResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT child_id FROM lineage_edges WHERE parent_id = ?1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![id], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

fn parent_ids_of(conn: &Connection, id: &str) -> StrataResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT parent_id FROM lineage_edges WHERE child_id = ?1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![id], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

/// Remove packets and their store-local rows, leaving tombstones.
///
/// Edges where a removed packet is the *parent* are kept: surviving children
/// now hold dangling references, which orphan repair cleans up. Embeddings,
/// facts and insights are left for orphan artifact cleanup.
pub(crate) fn delete_packets(
    tx: &Transaction<'_>,
    ids: &[String],
    reason: &str,
    now: DateTime<Utc>,
) -> StrataResult<usize> {
    let now = fmt_ts(now);
    let mut removed = 0;
    for id in ids {
        tx.execute(
            "UPDATE tag_index SET usage_count = MAX(0, usage_count - 1)
             WHERE tag IN (SELECT tag FROM packet_tags WHERE packet_id = ?1)",
            rusqlite::params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM packet_tags WHERE packet_id = ?1",
            rusqlite::params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM lineage_edges WHERE child_id = ?1",
            rusqlite::params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM annotations WHERE packet_id = ?1",
            rusqlite::params![id],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM pipeline_checkpoints WHERE packet_id = ?1",
            rusqlite::params![id],
        )
        .map_err(db_err)?;
        let n = tx
            .execute("DELETE FROM packets WHERE id = ?1", rusqlite::params![id])
            .map_err(db_err)?;
        if n > 0 {
            tx.execute(
                "INSERT OR REPLACE INTO evictions (packet_id, reason, evicted_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, reason, now],
            )
            .map_err(db_err)?;
            removed += n;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use serde_json::json;

    fn setup() -> PacketStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        PacketStore::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let store = setup();
        let new = NewPacket::new("event", json!({"action": "login", "user": "ana"}))
            .in_thread("t1")
            .with_tags(["auth", "web"]);
        let result = store.write(new.clone()).unwrap();
        assert!(!result.duplicate);
        assert_eq!(result.sequence, 1);

        let packet = store.read(result.id).unwrap();
        assert_eq!(packet.packet_type, new.packet_type);
        assert_eq!(packet.payload, new.payload);
        assert_eq!(packet.thread_id, "t1");
        assert_eq!(packet.tags, vec!["auth".to_string(), "web".to_string()]);
        assert!(packet.parent_ids.is_empty());
        assert_eq!(packet.lifecycle, Lifecycle::Active);
    }

    #[test]
    fn test_idempotent_write() {
        let store = setup();
        let new = NewPacket::new("event", json!({"action": "login"})).in_thread("t1");
        let first = store.write(new.clone()).unwrap();
        let second = store.write(new).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(store.fetch_thread("t1").unwrap().len(), 1);
    }

    #[test]
    fn test_read_missing() {
        let store = setup();
        let err = store.read(PacketId::new()).unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }

    #[test]
    fn test_corrupt_stored_tags_surface_as_serialization_error() {
        let store = setup();
        let written = store
            .write(NewPacket::new("event", json!({"n": 1})).with_tags(["ops"]))
            .unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE packets SET tags = 'not json', parent_ids = '{' WHERE id = ?1",
                rusqlite::params![written.id.to_string()],
            )
            .unwrap();

        let err = store.read(written.id).unwrap_err();
        assert!(matches!(err, StrataError::Serialization(_)));
        let err = store.fetch_thread(&written.thread_id).unwrap_err();
        assert!(matches!(err, StrataError::Serialization(_)));
    }

    #[test]
    fn test_thread_sequence_is_monotonic() {
        let store = setup();
        for i in 0..5 {
            let r = store
                .write(NewPacket::new("event", json!({"n": i})).in_thread("t1"))
                .unwrap();
            assert_eq!(r.sequence, i as u64 + 1);
        }
        store
            .write(NewPacket::new("event", json!({"n": 0})).in_thread("t2"))
            .unwrap();
        let thread = store.fetch_thread("t1").unwrap();
        let seqs: Vec<u64> = thread.iter().map(|p| p.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.thread_len("t1").unwrap(), 5);
        assert_eq!(store.thread_len("t2").unwrap(), 1);
    }

    #[test]
    fn test_default_thread_is_own_id() {
        let store = setup();
        let r = store.write(NewPacket::new("event", json!({"x": 1}))).unwrap();
        assert_eq!(r.thread_id, r.id.to_string());
    }

    #[test]
    fn test_missing_parent_rejected() {
        let store = setup();
        let err = store
            .write(NewPacket::new("event", json!({"x": 1})).with_parents(vec![PacketId::new()]))
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[test]
    fn test_dangling_parent_tolerated_when_allowed() {
        let store = setup().with_dangling_parents(true);
        let ghost = PacketId::new();
        let r = store
            .write(NewPacket::new("event", json!({"x": 1})).with_parents(vec![ghost]))
            .unwrap();
        assert_eq!(store.read(r.id).unwrap().parent_ids, vec![ghost]);
    }

    #[test]
    fn test_cycle_rejected_at_write() {
        let store = setup().with_dangling_parents(true);
        // B references a not-yet-existing A; writing A under B closes a loop.
        let a_id = PacketId::new();
        let b = store
            .write(NewPacket::new("event", json!({"name": "b"})).with_parents(vec![a_id]))
            .unwrap();
        let mut a = NewPacket::new("event", json!({"name": "a"})).with_parents(vec![b.id]);
        a.id = Some(a_id);
        let err = store.write(a).unwrap_err();
        assert!(matches!(err, StrataError::LineageIntegrity(_)));
        assert!(!store.exists(a_id).unwrap());
    }

    #[test]
    fn test_self_parent_rejected() {
        let id = PacketId::new();
        let mut new = NewPacket::new("event", json!({"x": 1})).with_parents(vec![id]);
        new.id = Some(id);
        let err = prepare(new, &IngestionConfig::default()).unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[test]
    fn test_prepare_validation() {
        let config = IngestionConfig::default();
        assert!(prepare(NewPacket::new("", json!({"x": 1})), &config).is_err());
        assert!(prepare(NewPacket::new("bad type!", json!({"x": 1})), &config).is_err());
        assert!(prepare(NewPacket::new("event", serde_json::Value::Null), &config).is_err());
        let small = IngestionConfig {
            max_payload_bytes: 8,
            ..Default::default()
        };
        assert!(prepare(NewPacket::new("event", json!({"text": "too long"})), &small).is_err());
        assert!(prepare(NewPacket::new("event", json!({"x": 1})), &config).is_ok());
    }

    #[test]
    fn test_ids_matching_tags_and_type() {
        let store = setup();
        let a = store
            .write(NewPacket::new("event", json!({"n": 1})).with_tags(["auth", "web"]))
            .unwrap();
        store
            .write(NewPacket::new("event", json!({"n": 2})).with_tags(["auth"]))
            .unwrap();
        store
            .write(NewPacket::new("analysis", json!({"n": 3})).with_tags(["auth", "web"]))
            .unwrap();

        let filter = PacketFilter {
            types: vec!["event".into()],
            tags: vec!["auth".into(), "web".into()],
            ..Default::default()
        };
        assert_eq!(store.ids_matching(&filter, 10).unwrap(), vec![a.id]);
    }

    #[test]
    fn test_delete_subtree_spares_multi_parent_children() {
        let store = setup();
        let root = store.write(NewPacket::new("event", json!({"n": "root"}))).unwrap();
        let other = store.write(NewPacket::new("event", json!({"n": "other"}))).unwrap();
        let only_child = store
            .write(NewPacket::new("analysis", json!({"n": "c1"})).with_parents(vec![root.id]))
            .unwrap();
        let shared = store
            .write(
                NewPacket::new("analysis", json!({"n": "c2"}))
                    .with_parents(vec![root.id, other.id]),
            )
            .unwrap();

        let removed = store.delete_subtree(root.id, "test").unwrap();
        assert_eq!(removed, 2);
        assert!(!store.exists(root.id).unwrap());
        assert!(!store.exists(only_child.id).unwrap());
        assert!(store.exists(shared.id).unwrap());
        assert!(store.was_evicted(root.id).unwrap());
    }

    #[test]
    fn test_recent_in_segment_only_prior_packets() {
        let store = setup();
        let mut ids = Vec::new();
        for i in 0..4 {
            let prepared =
                prepare(NewPacket::new("metric", json!({"v": i})), &IngestionConfig::default())
                    .unwrap();
            let annotation = ReasoningAnnotation {
                segment: "metric".into(),
                text_length: i,
                ..Default::default()
            };
            ids.push(
                store
                    .write_prepared(&prepared, Some(&annotation), false)
                    .unwrap()
                    .id,
            );
        }
        let history = store.recent_in_segment("metric", ids[2], 10).unwrap();
        let lens: Vec<usize> = history.iter().map(|a| a.text_length).collect();
        assert_eq!(lens, vec![1, 0]);
    }
}
