//! Knowledge store: append-only facts and extracted insights.

use crate::packet_store::parse_id;
use crate::{db_err, fmt_ts, lock_err, parse_ts};
use chrono::Utc;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use strata_types::error::StrataResult;
use strata_types::knowledge::{
    ExtractedInsight, Extraction, FactQuery, InsightKind, InsightQuery, KnowledgeFact,
};
use strata_types::packet::PacketId;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 100;

/// Knowledge store backed by SQLite.
#[derive(Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
}

impl KnowledgeStore {
    /// Create a new knowledge store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append facts in one transaction. Ids and timestamps are assigned here.
    pub fn add_facts(&self, facts: &[KnowledgeFact]) -> StrataResult<Vec<String>> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(db_err)?;
        let ids = insert_facts(&tx, facts)?;
        tx.commit().map_err(db_err)?;
        Ok(ids)
    }

    /// Append insights in one transaction. Ids and timestamps are assigned here.
    pub fn add_insights(&self, insights: &[ExtractedInsight]) -> StrataResult<Vec<String>> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(db_err)?;
        let ids = insert_insights(&tx, insights)?;
        tx.commit().map_err(db_err)?;
        Ok(ids)
    }

    /// Store the extraction for `packet` unless one is already stored.
    ///
    /// The check and the inserts share one transaction, so concurrent
    /// callers store it at most once. Returns whether anything was written.
    pub fn store_extraction(&self, packet: PacketId, extraction: &Extraction) -> StrataResult<bool> {
        let mut conn = self.conn.lock().map_err(lock_err)?;
        let tx = conn.transaction().map_err(db_err)?;
        if extraction_exists(&tx, &packet.to_string())? {
            return Ok(false);
        }
        insert_insights(&tx, &extraction.insights)?;
        insert_facts(&tx, &extraction.facts)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Whether anything has been stored for `packet`.
    pub fn has_extraction(&self, packet: &str) -> StrataResult<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        extraction_exists(&conn, packet)
    }

    /// Query facts, highest confidence first.
    pub fn query_facts(&self, query: &FactQuery) -> StrataResult<Vec<KnowledgeFact>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut sql = String::from(
            "SELECT id, subject, predicate, object, confidence, source_packet, created_at
             FROM facts WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1;

        if let Some(ref subject) = query.subject {
            sql.push_str(&format!(" AND subject = ?{idx}"));
            params.push(Box::new(subject.clone()));
            idx += 1;
        }
        if let Some(ref predicate) = query.predicate {
            sql.push_str(&format!(" AND predicate = ?{idx}"));
            params.push(Box::new(predicate.clone()));
            idx += 1;
        }
        if let Some(source) = query.source_packet {
            sql.push_str(&format!(" AND source_packet = ?{idx}"));
            params.push(Box::new(source.to_string()));
            idx += 1;
        }
        if let Some(min) = query.min_confidence {
            sql.push_str(&format!(" AND confidence >= ?{idx}"));
            params.push(Box::new(min as f64));
        }
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        sql.push_str(&format!(
            " ORDER BY confidence DESC, created_at DESC, id ASC LIMIT {limit}"
        ));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db_err)?;

        let mut facts = Vec::new();
        for row in rows {
            let (id, subject, predicate, object, confidence, source, created) =
                row.map_err(db_err)?;
            facts.push(KnowledgeFact {
                id,
                subject,
                predicate,
                object,
                confidence: confidence as f32,
                source_packet: parse_id(&source)?,
                created_at: parse_ts(&created),
            });
        }
        Ok(facts)
    }

    /// Query insights, highest confidence first.
    pub fn query_insights(&self, query: &InsightQuery) -> StrataResult<Vec<ExtractedInsight>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut sql = String::from(
            "SELECT id, kind, content, confidence, source_packet, created_at
             FROM insights WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1;

        if let Some(packet) = query.packet_id {
            sql.push_str(&format!(" AND source_packet = ?{idx}"));
            params.push(Box::new(packet.to_string()));
            idx += 1;
        }
        if let Some(kind) = query.kind {
            sql.push_str(&format!(" AND kind = ?{idx}"));
            params.push(Box::new(kind.as_str().to_string()));
            idx += 1;
        }
        if let Some(min) = query.min_confidence {
            sql.push_str(&format!(" AND confidence >= ?{idx}"));
            params.push(Box::new(min as f64));
        }
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        sql.push_str(&format!(
            " ORDER BY confidence DESC, created_at DESC, id ASC LIMIT {limit}"
        ));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?;

        let mut insights = Vec::new();
        for row in rows {
            let (id, kind_str, content, confidence, source, created) = row.map_err(db_err)?;
            let kind = match kind_str.parse::<InsightKind>() {
                Ok(k) => k,
                Err(e) => {
                    warn!(insight = %id, "Skipping insight: {e}");
                    continue;
                }
            };
            insights.push(ExtractedInsight {
                id,
                kind,
                content,
                confidence: confidence as f32,
                source_packet: parse_id(&source)?,
                created_at: parse_ts(&created),
            });
        }
        Ok(insights)
    }
}

fn extraction_exists(conn: &Connection, packet: &str) -> StrataResult<bool> {
    let n: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM facts WHERE source_packet = ?1)
                  + (SELECT COUNT(*) FROM insights WHERE source_packet = ?1)",
            rusqlite::params![packet],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

fn insert_facts(conn: &Connection, facts: &[KnowledgeFact]) -> StrataResult<Vec<String>> {
    let now = fmt_ts(Utc::now());
    let mut ids = Vec::with_capacity(facts.len());
    for fact in facts {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO facts (id, subject, predicate, object, confidence, source_packet, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                fact.subject,
                fact.predicate,
                fact.object,
                fact.confidence as f64,
                fact.source_packet.to_string(),
                now,
            ],
        )
        .map_err(db_err)?;
        ids.push(id);
    }
    Ok(ids)
}

fn insert_insights(conn: &Connection, insights: &[ExtractedInsight]) -> StrataResult<Vec<String>> {
    let now = fmt_ts(Utc::now());
    let mut ids = Vec::with_capacity(insights.len());
    for insight in insights {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO insights (id, kind, content, confidence, source_packet, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                insight.kind.as_str(),
                insight.content,
                insight.confidence as f64,
                insight.source_packet.to_string(),
                now,
            ],
        )
        .map_err(db_err)?;
        ids.push(id);
    }
    Ok(ids)
}
