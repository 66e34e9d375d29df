use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_messages_table(conn)?;
    create_events_table(conn)?;
    create_clusters_table(conn)?;
    create_authority_table(conn)?;
    create_emissions_table(conn)?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            source_id   TEXT NOT NULL,
            message_id  INTEGER NOT NULL,
            arrived_at  TEXT NOT NULL,
            hash        TEXT NOT NULL,
            text_norm   TEXT NOT NULL,
            PRIMARY KEY (source_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_hash
            ON messages(hash, arrived_at);",
    )?;
    Ok(())
}

fn create_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            event_id          TEXT PRIMARY KEY,
            cluster_id        TEXT,
            kind              TEXT NOT NULL,
            location          TEXT NOT NULL,
            lat               REAL,
            lon               REAL,
            entities_json     TEXT NOT NULL,
            message_refs_json TEXT NOT NULL,
            time_hint         TEXT,
            summary           TEXT NOT NULL,
            confidence_self   REAL NOT NULL,
            created_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_created
            ON events(created_at);
        CREATE INDEX IF NOT EXISTS idx_events_cluster
            ON events(cluster_id);",
    )?;
    Ok(())
}

fn create_clusters_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS clusters (
            cluster_id   TEXT PRIMARY KEY,
            state        TEXT NOT NULL,
            first_seen   TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_authority_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS authority (
            source_id      TEXT PRIMARY KEY,
            score          REAL NOT NULL,
            corroborations INTEGER NOT NULL DEFAULT 0,
            contradictions INTEGER NOT NULL DEFAULT 0,
            last_update    TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Emission log — one row per summary or retraction actually delivered.
/// Backs the `/stats` last-hour counter.
fn create_emissions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS emissions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            cluster_id TEXT NOT NULL,
            kind       TEXT NOT NULL,
            emitted_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_emissions_time
            ON emissions(emitted_at);",
    )?;
    Ok(())
}
