//! SQLite schema creation and migration.
//!
//! Creates all tables needed by the substrate on first boot. Migrations are
//! additive only: later versions add tables or defaulted columns so that
//! historical packets always read back.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Check if a column exists in a table (SQLite has no ADD COLUMN IF NOT EXISTS).
fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({})", table);
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return false;
    };
    let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(1)) else {
        return false;
    };
    let names: Vec<String> = rows.filter_map(|r| r.ok()).collect();
    names.iter().any(|n| n == column)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: Create the three logical stores plus pipeline bookkeeping.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Packet ledger
        CREATE TABLE IF NOT EXISTS packets (
            id TEXT PRIMARY KEY,
            packet_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            parent_ids TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            ttl TEXT,
            created_at TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            dedup_key TEXT NOT NULL UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_packets_thread_seq ON packets(thread_id, sequence);
        CREATE INDEX IF NOT EXISTS idx_packets_type ON packets(packet_type);
        CREATE INDEX IF NOT EXISTS idx_packets_ttl ON packets(ttl);

        -- Per-thread sequence counters
        CREATE TABLE IF NOT EXISTS thread_sequences (
            thread_id TEXT PRIMARY KEY,
            last_seq INTEGER NOT NULL
        );

        -- Lineage edges (child lists parent in parent_ids)
        CREATE TABLE IF NOT EXISTS lineage_edges (
            child_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (child_id, parent_id)
        );
        CREATE INDEX IF NOT EXISTS idx_lineage_parent ON lineage_edges(parent_id);

        -- Tag membership and usage index
        CREATE TABLE IF NOT EXISTS packet_tags (
            packet_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (packet_id, tag)
        );
        CREATE INDEX IF NOT EXISTS idx_packet_tags_tag ON packet_tags(tag);
        CREATE TABLE IF NOT EXISTS tag_index (
            tag TEXT PRIMARY KEY,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT NOT NULL
        );

        -- Reasoning annotations
        CREATE TABLE IF NOT EXISTS annotations (
            packet_id TEXT PRIMARY KEY,
            segment TEXT NOT NULL,
            annotation TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_annotations_segment ON annotations(segment);

        -- Embedding index
        CREATE TABLE IF NOT EXISTS embeddings (
            id TEXT PRIMARY KEY,
            packet_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (packet_id, model)
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model);

        -- Knowledge facts
        CREATE TABLE IF NOT EXISTS facts (
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            predicate TEXT NOT NULL,
            object TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_packet TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts(subject);
        CREATE INDEX IF NOT EXISTS idx_facts_source ON facts(source_packet);

        -- Extracted insights
        CREATE TABLE IF NOT EXISTS insights (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_packet TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_insights_source ON insights(source_packet);
        CREATE INDEX IF NOT EXISTS idx_insights_kind ON insights(kind);

        -- Pipeline progress per packet
        CREATE TABLE IF NOT EXISTS pipeline_checkpoints (
            packet_id TEXT PRIMARY KEY,
            last_stage TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_completed ON pipeline_checkpoints(completed);

        -- Housekeeping history
        CREATE TABLE IF NOT EXISTS gc_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            report TEXT NOT NULL
        );

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Initial schema');
        ",
    )?;
    Ok(())
}

/// Version 2: Lifecycle tracking, orphan bookkeeping, retry bookkeeping, tombstones.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    let packet_cols = [
        ("lifecycle", "TEXT NOT NULL DEFAULT 'active'"),
        ("orphaned_at", "TEXT DEFAULT NULL"),
        ("origin_parent_count", "INTEGER NOT NULL DEFAULT 0"),
    ];
    for (name, typedef) in &packet_cols {
        if !column_exists(conn, "packets", name) {
            conn.execute(
                &format!("ALTER TABLE packets ADD COLUMN {} {}", name, typedef),
                [],
            )?;
        }
    }
    if !column_exists(conn, "pipeline_checkpoints", "failed_stages") {
        conn.execute(
            "ALTER TABLE pipeline_checkpoints ADD COLUMN failed_stages TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_packets_lifecycle ON packets(lifecycle);

        CREATE TABLE IF NOT EXISTS evictions (
            packet_id TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            evicted_at TEXT NOT NULL
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (2, datetime('now'), 'Add lifecycle, orphan and retry bookkeeping');
        ",
    )?;
    Ok(())
}
