//! Per-packet pipeline checkpoints.
//!
//! A checkpoint row is created in the same transaction as the durable write
//! and advanced as enrichment stages finish. Failed stages are remembered so
//! reconciliation can retry them.

use crate::packet_store::parse_id;
use crate::{db_err, fmt_ts, lock_err, parse_ts};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use strata_types::error::StrataResult;
use strata_types::packet::PacketId;
use strata_types::pipeline::Stage;

/// Stored pipeline progress for one packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Packet the checkpoint belongs to.
    pub packet_id: PacketId,
    /// Last stage that finished (successfully or not).
    pub last_stage: Stage,
    /// Whether the whole pipeline has run.
    pub completed: bool,
    /// Number of runs started for this packet.
    pub attempts: u32,
    /// Enrichment stages whose last attempt failed.
    pub failed_stages: Vec<Stage>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint table access.
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    /// Create a new checkpoint store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Record that `stage` finished for `id`.
    pub fn set_stage(&self, id: PacketId, stage: Stage) -> StrataResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO pipeline_checkpoints (packet_id, last_stage, completed, attempts, updated_at, failed_stages)
             VALUES (?1, ?2, 0, 1, ?3, '[]')
             ON CONFLICT(packet_id) DO UPDATE SET last_stage = ?2, updated_at = ?3",
            rusqlite::params![id.to_string(), stage.as_str(), fmt_ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Mark the pipeline finished for `id`.
    pub fn mark_complete(&self, id: PacketId) -> StrataResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "UPDATE pipeline_checkpoints SET completed = 1, last_stage = ?2, updated_at = ?3 WHERE packet_id = ?1",
            rusqlite::params![
                id.to_string(),
                Stage::Checkpoint.as_str(),
                fmt_ts(Utc::now())
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Claim an unfinished pipeline for another run.
    ///
    /// Succeeds only when the checkpoint has not advanced since
    /// `stale_before`; the attempt counter and `updated_at` move in the same
    /// statement, so of two concurrent callers at most one gets the state.
    pub fn claim(
        &self,
        id: PacketId,
        stale_before: DateTime<Utc>,
    ) -> StrataResult<Option<CheckpointState>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let claimed = conn
            .execute(
                "UPDATE pipeline_checkpoints SET attempts = attempts + 1, updated_at = ?2
                 WHERE packet_id = ?1 AND completed = 0 AND updated_at <= ?3",
                rusqlite::params![id.to_string(), fmt_ts(Utc::now()), fmt_ts(stale_before)],
            )
            .map_err(db_err)?;
        if claimed == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT packet_id, last_stage, completed, attempts, failed_stages, updated_at
             FROM pipeline_checkpoints WHERE packet_id = ?1",
            rusqlite::params![id.to_string()],
            row_to_raw,
        )
        .optional()
        .map_err(db_err)?
        .map(RawCheckpoint::into_state)
        .transpose()
    }

    /// Remember that `stage` failed for `id`.
    pub fn record_failure(&self, id: PacketId, stage: Stage) -> StrataResult<()> {
        self.update_failed(id, |failed| {
            if !failed.contains(&stage) {
                failed.push(stage);
            }
        })
    }

    /// Forget an earlier failure of `stage` for `id`.
    pub fn clear_failure(&self, id: PacketId, stage: Stage) -> StrataResult<()> {
        self.update_failed(id, |failed| failed.retain(|s| *s != stage))
    }

    fn update_failed(&self, id: PacketId, f: impl FnOnce(&mut Vec<Stage>)) -> StrataResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT failed_stages FROM pipeline_checkpoints WHERE packet_id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(raw) = raw else {
            return Ok(());
        };
        let mut failed = decode_stages(&raw);
        f(&mut failed);
        conn.execute(
            "UPDATE pipeline_checkpoints SET failed_stages = ?2, updated_at = ?3 WHERE packet_id = ?1",
            rusqlite::params![
                id.to_string(),
                serde_json::to_string(&failed)?,
                fmt_ts(Utc::now())
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Checkpoint for `id`, if any.
    pub fn get(&self, id: PacketId) -> StrataResult<Option<CheckpointState>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row(
            "SELECT packet_id, last_stage, completed, attempts, failed_stages, updated_at
             FROM pipeline_checkpoints WHERE packet_id = ?1",
            rusqlite::params![id.to_string()],
            row_to_raw,
        )
        .optional()
        .map_err(db_err)?
        .map(RawCheckpoint::into_state)
        .transpose()
    }

    /// Packets whose pipeline never completed, oldest first.
    pub fn incomplete(&self, limit: usize) -> StrataResult<Vec<CheckpointState>> {
        self.query(
            "SELECT packet_id, last_stage, completed, attempts, failed_stages, updated_at
             FROM pipeline_checkpoints WHERE completed = 0
             ORDER BY updated_at ASC LIMIT ?1",
            limit,
        )
    }

    /// Completed packets with at least one failed enrichment stage.
    pub fn with_failures(&self, limit: usize) -> StrataResult<Vec<CheckpointState>> {
        self.query(
            "SELECT packet_id, last_stage, completed, attempts, failed_stages, updated_at
             FROM pipeline_checkpoints WHERE completed = 1 AND failed_stages != '[]'
             ORDER BY updated_at ASC LIMIT ?1",
            limit,
        )
    }

    fn query(&self, sql: &str, limit: usize) -> StrataResult<Vec<CheckpointState>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], row_to_raw)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?.into_state()?);
        }
        Ok(out)
    }
}

struct RawCheckpoint {
    packet_id: String,
    last_stage: String,
    completed: bool,
    attempts: i64,
    failed_stages: String,
    updated_at: String,
}

impl RawCheckpoint {
    fn into_state(self) -> StrataResult<CheckpointState> {
        Ok(CheckpointState {
            packet_id: parse_id(&self.packet_id)?,
            last_stage: Stage::parse(&self.last_stage).unwrap_or(Stage::MemoryWrite),
            completed: self.completed,
            attempts: self.attempts.max(0) as u32,
            failed_stages: decode_stages(&self.failed_stages),
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        packet_id: row.get(0)?,
        last_stage: row.get(1)?,
        completed: row.get::<_, i64>(2)? != 0,
        attempts: row.get(3)?,
        failed_stages: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn decode_stages(raw: &str) -> Vec<Stage> {
    serde_json::from_str(raw).unwrap_or_default()
}
