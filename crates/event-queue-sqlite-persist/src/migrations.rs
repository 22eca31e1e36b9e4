//! Queue schema migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::QueueResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> QueueResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Queue schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running queue migrations");

    if current_version < 1 {
        migrate_v1_queue_tables(conn)?;
    }
    if current_version < 2 {
        migrate_v2_claim_indexes(conn)?;
    }
    if current_version < 3 {
        migrate_v3_consent_parked(conn)?;
    }

    info!("Queue migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> QueueResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: one row per event, one row per (event, pending destination).
fn migrate_v1_queue_tables(conn: &Connection) -> QueueResult<()> {
    info!("Applying migration v1: queue tables");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            event_blob TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_destinations (
            event_id TEXT NOT NULL REFERENCES queue_events(event_id) ON DELETE CASCADE,
            destination TEXT NOT NULL,
            PRIMARY KEY (event_id, destination)
        );
        ",
    )?;

    record_migration(conn, 1, "queue_tables")
}

/// V2: indexes backing oldest-first claims and per-destination scans.
fn migrate_v2_claim_indexes(conn: &Connection) -> QueueResult<()> {
    info!("Applying migration v2: claim indexes");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_queue_events_timestamp
            ON queue_events(timestamp_ms, seq);
        CREATE INDEX IF NOT EXISTS idx_queue_destinations_destination
            ON queue_destinations(destination);
        ",
    )?;

    record_migration(conn, 2, "claim_indexes")
}

/// V3: events the consent gate keeps outside the delivery queue.
fn migrate_v3_consent_parked(conn: &Connection) -> QueueResult<()> {
    info!("Applying migration v3: consent parked events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS consent_parked (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_blob TEXT NOT NULL,
            processed TEXT NOT NULL DEFAULT '[]',
            refired INTEGER NOT NULL DEFAULT 0,
            UNIQUE (kind, event_id)
        );
        ",
    )?;

    record_migration(conn, 3, "consent_parked")
}
