//! Memory substrate for the Strata event store.
//!
//! Provides a durable, queryable packet ledger over three logical stores:
//! - **Packet store** (SQLite): the canonical ledger, thread sequences, lineage edges, tags
//! - **Embedding index** (SQLite BLOBs): one vector per (packet, model), cosine similarity search
//! - **Knowledge store** (SQLite): append-only facts and extracted insights
//!
//! On top of the stores sit the ingestion pipeline, the retrieval subsystem,
//! the insight extraction engine and the housekeeping engine. `MemorySubstrate`
//! wires them together.

pub mod checkpoint;
pub mod embedding;
pub mod housekeeping;
pub mod insights;
pub mod knowledge;
pub mod lineage;
pub mod migration;
pub mod notifier;
pub mod packet_store;
pub mod pipeline;
pub mod pool;
pub mod reasoning;
pub mod retrieval;
pub mod semantic;

mod substrate;
pub use substrate::{HealthReport, MemorySubstrate};

use chrono::{DateTime, SecondsFormat, Utc};
use strata_types::error::StrataError;

/// Format a timestamp so that lexical order matches chronological order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now for corrupt rows.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Map a SQLite failure onto the storage error.
pub(crate) fn db_err(e: rusqlite::Error) -> StrataError {
    StrataError::StorageUnavailable(e.to_string())
}

/// Map a poisoned lock onto the internal error.
pub(crate) fn lock_err<T>(e: std::sync::PoisonError<T>) -> StrataError {
    StrataError::Internal(e.to_string())
}
