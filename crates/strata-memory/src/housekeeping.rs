//! Housekeeping: TTL eviction, lineage repair and garbage collection.
//!
//! Five independent operations, each idempotent and safe to run alongside
//! ingestion. Every operation works in batches of `batch_size` rows and
//! commits after each batch, releasing the connection in between so a long
//! pass never blocks writers for more than one batch.

use crate::packet_store::{delete_packets, parse_id, PacketStore};
use crate::{db_err, fmt_ts, lock_err};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use strata_types::config::HousekeepingConfig;
use strata_types::error::StrataResult;
use strata_types::housekeeping::GcReport;
use strata_types::packet::PacketId;
use tracing::{debug, info};

/// Housekeeping engine.
#[derive(Clone)]
pub struct HousekeepingEngine {
    conn: Arc<Mutex<Connection>>,
    packets: PacketStore,
    config: HousekeepingConfig,
}

impl HousekeepingEngine {
    /// Create a new engine over the shared connection.
    pub fn new(conn: Arc<Mutex<Connection>>, config: HousekeepingConfig) -> Self {
        Self {
            packets: PacketStore::new(conn.clone()),
            conn,
            config,
        }
    }

    fn batch(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Evict packets whose TTL has passed.
    pub fn evict_expired_ttl(&self) -> StrataResult<u64> {
        self.evict_expired_ttl_at(Utc::now())
    }

    /// Evict packets whose TTL passed at `now`.
    ///
    /// Two-phase: active packets are first marked `expired`, then deleted in
    /// batches with an eviction tombstone. Children are never touched unless
    /// their own TTL has passed; references to an evicted parent are left
    /// for orphan repair.
    pub fn evict_expired_ttl_at(&self, now: DateTime<Utc>) -> StrataResult<u64> {
        let now_str = fmt_ts(now);
        let marked = {
            let conn = self.conn.lock().map_err(lock_err)?;
            conn.execute(
                "UPDATE packets SET lifecycle = 'expired'
                 WHERE lifecycle = 'active' AND ttl IS NOT NULL AND ttl <= ?1",
                rusqlite::params![now_str],
            )
            .map_err(db_err)?
        };
        if marked > 0 {
            debug!(marked, "Marked packets expired");
        }

        let mut evicted = 0u64;
        loop {
            let mut conn = self.conn.lock().map_err(lock_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let ids = select_ids(
                &tx,
                "SELECT id FROM packets WHERE lifecycle = 'expired' ORDER BY ttl ASC LIMIT ?1",
                self.batch(),
            )?;
            if ids.is_empty() {
                break;
            }
            evicted += delete_packets(&tx, &ids, "ttl_expired", now)? as u64;
            tx.commit().map_err(db_err)?;
        }
        Ok(evicted)
    }

    /// Remove parent references that point at packets which no longer exist.
    pub fn cleanup_orphan_packets(&self) -> StrataResult<u64> {
        self.cleanup_orphan_packets_at(Utc::now())
    }

    /// Remove dangling parent references; children left with no parents are
    /// stamped `orphaned_at = now`. The child itself is never deleted.
    pub fn cleanup_orphan_packets_at(&self, now: DateTime<Utc>) -> StrataResult<u64> {
        let now_str = fmt_ts(now);
        let mut repaired = 0u64;
        loop {
            let mut conn = self.conn.lock().map_err(lock_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            let children = select_ids(
                &tx,
                "SELECT DISTINCT e.child_id FROM lineage_edges e
                 WHERE NOT EXISTS (SELECT 1 FROM packets p WHERE p.id = e.parent_id)
                 LIMIT ?1",
                self.batch(),
            )?;
            if children.is_empty() {
                break;
            }

            for child in &children {
                repaired += tx
                    .execute(
                        "DELETE FROM lineage_edges
                         WHERE child_id = ?1
                           AND NOT EXISTS (SELECT 1 FROM packets p WHERE p.id = lineage_edges.parent_id)",
                        rusqlite::params![child],
                    )
                    .map_err(db_err)? as u64;

                let parents_json: Option<String> = tx
                    .query_row(
                        "SELECT parent_ids FROM packets WHERE id = ?1",
                        rusqlite::params![child],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                let Some(parents_json) = parents_json else {
                    continue;
                };
                let parents: Vec<PacketId> = serde_json::from_str(&parents_json)?;
                let mut remaining = Vec::with_capacity(parents.len());
                for parent in parents {
                    let exists = tx
                        .query_row(
                            "SELECT 1 FROM packets WHERE id = ?1",
                            rusqlite::params![parent.to_string()],
                            |_| Ok(()),
                        )
                        .optional()
                        .map_err(db_err)?
                        .is_some();
                    if exists {
                        remaining.push(parent);
                    }
                }
                tx.execute(
                    "UPDATE packets SET parent_ids = ?2,
                         orphaned_at = CASE WHEN ?3 = 0 THEN COALESCE(orphaned_at, ?4) ELSE orphaned_at END
                     WHERE id = ?1",
                    rusqlite::params![
                        child,
                        serde_json::to_string(&remaining)?,
                        remaining.len() as i64,
                        now_str
                    ],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
        }
        Ok(repaired)
    }

    /// Remove derived packets whose roots are gone.
    pub fn cleanup_parentless_packets(&self) -> StrataResult<u64> {
        self.cleanup_parentless_packets_at(Utc::now())
    }

    /// Remove packets of a derived type that were created with parents, have
    /// none left, and were orphaned more than `parentless_grace_secs` before
    /// `now`. Each is removed with its exclusively-owned descendants.
    pub fn cleanup_parentless_packets_at(&self, now: DateTime<Utc>) -> StrataResult<u64> {
        if self.config.derived_types.is_empty() {
            return Ok(0);
        }
        let cutoff = fmt_ts(now - chrono::Duration::seconds(self.config.parentless_grace_secs as i64));
        let placeholders: Vec<String> = (0..self.config.derived_types.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        let sql = format!(
            "SELECT p.id FROM packets p
             WHERE p.origin_parent_count > 0
               AND p.orphaned_at IS NOT NULL AND p.orphaned_at <= ?1
               AND NOT EXISTS (SELECT 1 FROM lineage_edges e WHERE e.child_id = p.id)
               AND p.packet_type IN ({})
             ORDER BY p.orphaned_at ASC LIMIT ?2",
            placeholders.join(", ")
        );

        let mut removed = 0u64;
        loop {
            let candidates = {
                let conn = self.conn.lock().map_err(lock_err)?;
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(cutoff.clone()), Box::new(self.batch() as i64)];
                for t in &self.config.derived_types {
                    params.push(Box::new(t.clone()));
                }
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                let rows = stmt
                    .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(parse_id(&row.map_err(db_err)?)?);
                }
                ids
            };
            if candidates.is_empty() {
                break;
            }
            for id in candidates {
                removed += self.packets.delete_subtree(id, "parentless")? as u64;
            }
        }
        Ok(removed)
    }

    /// Delete embeddings, insights and facts (plus annotations and
    /// checkpoints) whose owning packet no longer exists.
    ///
    /// Returns `(embeddings, insights, facts)` removed.
    pub fn cleanup_orphan_artifacts(&self) -> StrataResult<(u64, u64, u64)> {
        let embeddings = self.delete_orphans("embeddings", "packet_id")?;
        let insights = self.delete_orphans("insights", "source_packet")?;
        let facts = self.delete_orphans("facts", "source_packet")?;
        let annotations = self.delete_orphans("annotations", "packet_id")?;
        let checkpoints = self.delete_orphans("pipeline_checkpoints", "packet_id")?;
        if annotations + checkpoints > 0 {
            debug!(annotations, checkpoints, "Removed orphan pipeline rows");
        }
        Ok((embeddings, insights, facts))
    }

    fn delete_orphans(&self, table: &str, owner_column: &str) -> StrataResult<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN (
                 SELECT t.rowid FROM {table} t
                 WHERE NOT EXISTS (SELECT 1 FROM packets p WHERE p.id = t.{owner_column})
                 LIMIT ?1
             )"
        );
        let mut total = 0u64;
        loop {
            let conn = self.conn.lock().map_err(lock_err)?;
            let n = conn
                .execute(&sql, rusqlite::params![self.batch() as i64])
                .map_err(db_err)?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    }

    /// Recompute tag usage and drop entries below the low watermark.
    pub fn gc_unused_tags(&self) -> StrataResult<u64> {
        {
            let conn = self.conn.lock().map_err(lock_err)?;
            conn.execute(
                "UPDATE tag_index SET usage_count =
                     (SELECT COUNT(*) FROM packet_tags pt WHERE pt.tag = tag_index.tag)",
                [],
            )
            .map_err(db_err)?;
        }
        let watermark = self.config.tag_low_watermark as i64;
        let mut total = 0u64;
        loop {
            let conn = self.conn.lock().map_err(lock_err)?;
            let n = conn
                .execute(
                    "DELETE FROM tag_index WHERE tag IN (
                         SELECT tag FROM tag_index WHERE usage_count < ?1 LIMIT ?2
                     )",
                    rusqlite::params![watermark, self.batch() as i64],
                )
                .map_err(db_err)?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    }

    /// Run all five operations in dependency order and record the report.
    pub fn run_full_gc(&self) -> StrataResult<GcReport> {
        self.run_full_gc_at(Utc::now())
    }

    /// `run_full_gc` with an explicit clock.
    pub fn run_full_gc_at(&self, now: DateTime<Utc>) -> StrataResult<GcReport> {
        let start = std::time::Instant::now();
        let started_at = Utc::now();

        let ttl_evicted = self.evict_expired_ttl_at(now)?;
        let orphan_refs_repaired = self.cleanup_orphan_packets_at(now)?;
        let parentless_removed = self.cleanup_parentless_packets_at(now)?;
        let (orphan_embeddings, orphan_insights, orphan_facts) = self.cleanup_orphan_artifacts()?;
        let tags_collected = self.gc_unused_tags()?;

        let report = GcReport {
            ttl_evicted,
            orphan_refs_repaired,
            parentless_removed,
            orphan_embeddings,
            orphan_insights,
            orphan_facts,
            tags_collected,
            started_at: Some(started_at),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        {
            let conn = self.conn.lock().map_err(lock_err)?;
            conn.execute(
                "INSERT INTO gc_runs (started_at, report) VALUES (?1, ?2)",
                rusqlite::params![fmt_ts(started_at), serde_json::to_string(&report)?],
            )
            .map_err(db_err)?;
        }

        info!(
            ttl_evicted,
            orphan_refs_repaired,
            parentless_removed,
            orphan_embeddings,
            orphan_insights,
            orphan_facts,
            tags_collected,
            duration_ms = report.duration_ms,
            "Housekeeping pass complete"
        );
        Ok(report)
    }

    /// The most recently recorded report.
    pub fn last_report(&self) -> StrataResult<Option<GcReport>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT report FROM gc_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}

fn select_ids(conn: &Connection, sql: &str, limit: usize) -> StrataResult<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params![limit as i64], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}
