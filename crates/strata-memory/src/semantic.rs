//! Embedding index: one vector per (packet, model), ranked by cosine similarity.
//!
//! Vectors are stored as little-endian f32 BLOBs. Search is a brute-force scan
//! over the vectors of one model, joined against the packet ledger so only
//! active packets are ranked.

use crate::embedding::{cosine_similarity, embedding_from_bytes, embedding_to_bytes};
use crate::packet_store::parse_id;
use crate::{db_err, fmt_ts, lock_err, parse_ts};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use strata_types::error::StrataResult;
use strata_types::knowledge::EmbeddingRecord;
use strata_types::packet::PacketId;
use tracing::debug;

/// A packet id with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    /// Matching packet.
    pub id: PacketId,
    /// Cosine similarity to the query vector.
    pub score: f32,
    /// Packet creation time, for tie-breaking.
    pub created_at: DateTime<Utc>,
}

/// Embedding index backed by SQLite.
#[derive(Clone)]
pub struct EmbeddingIndex {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddingIndex {
    /// Create a new index wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Store the vector for `(packet_id, model)`.
    ///
    /// Returns `false` when a vector already exists for the pair; the stored
    /// one is kept.
    pub fn store(&self, packet_id: PacketId, model: &str, vector: &[f32]) -> StrataResult<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO embeddings (id, packet_id, model, dimensions, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    uuid::Uuid::new_v4().to_string(),
                    packet_id.to_string(),
                    model,
                    vector.len() as i64,
                    embedding_to_bytes(vector),
                    fmt_ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if n > 0 {
            debug!(packet_id = %packet_id, model, dims = vector.len(), "Stored embedding");
        }
        Ok(n > 0)
    }

    /// The stored record for `(packet_id, model)`.
    pub fn get(&self, packet_id: PacketId, model: &str) -> StrataResult<Option<EmbeddingRecord>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let row = conn
            .query_row(
                "SELECT id, vector, created_at FROM embeddings WHERE packet_id = ?1 AND model = ?2",
                rusqlite::params![packet_id.to_string(), model],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        Ok(row.map(|(embedding_id, bytes, created)| EmbeddingRecord {
            embedding_id,
            packet_id,
            model: model.to_string(),
            vector: embedding_from_bytes(&bytes),
            created_at: parse_ts(&created),
        }))
    }

    /// Score every active packet embedded with `model` against `query`.
    ///
    /// When `candidates` is given, only those packets are scored. Vectors whose
    /// dimensionality differs from the query are skipped. Results are
    /// unordered.
    pub fn search(
        &self,
        query: &[f32],
        model: &str,
        candidates: Option<&[PacketId]>,
    ) -> StrataResult<Vec<ScoredId>> {
        let allowed: Option<HashSet<String>> =
            candidates.map(|ids| ids.iter().map(|id| id.to_string()).collect());
        if allowed.as_ref().is_some_and(|a| a.is_empty()) {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT e.packet_id, e.vector, p.created_at
                 FROM embeddings e JOIN packets p ON p.id = e.packet_id
                 WHERE e.model = ?1 AND e.dimensions = ?2 AND p.lifecycle = 'active'",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![model, query.len() as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut scored = Vec::new();
        for row in rows {
            let (id_str, bytes, created) = row.map_err(db_err)?;
            if let Some(ref allowed) = allowed {
                if !allowed.contains(&id_str) {
                    continue;
                }
            }
            let vector = embedding_from_bytes(&bytes);
            scored.push(ScoredId {
                id: parse_id(&id_str)?,
                score: cosine_similarity(query, &vector),
                created_at: parse_ts(&created),
            });
        }
        debug!(model, scored = scored.len(), "Scored embeddings");
        Ok(scored)
    }

    /// Active packets with no vector for `model`, oldest first.
    pub fn missing_for_model(&self, model: &str, limit: usize) -> StrataResult<Vec<PacketId>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT p.id FROM packets p
                 WHERE p.lifecycle = 'active'
                   AND NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.packet_id = p.id AND e.model = ?1)
                 ORDER BY p.created_at ASC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![model, limit as i64], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_id(&row.map_err(db_err)?)?);
        }
        Ok(ids)
    }

    /// Number of stored vectors.
    pub fn count(&self) -> StrataResult<u64> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }
}
