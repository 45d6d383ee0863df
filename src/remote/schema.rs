//! Shared store schema

use rusqlite::Connection;
use tracing::info;

use crate::error::SyncError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating shared store schema v{}", SCHEMA_VERSION);
        conn.execute_batch(TEAMS_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating shared store from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Events, their rosters and one document per team
const TEAMS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Roster: which teams take part in an event
CREATE TABLE IF NOT EXISTS event_teams (
    event_id TEXT NOT NULL,
    team_id TEXT NOT NULL,
    PRIMARY KEY (event_id, team_id),
    FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE
);

-- Team documents. Activities are a JSON array of entries; only whole-entry
-- replacement inside a transaction is allowed.
CREATE TABLE IF NOT EXISTS teams (
    event_id TEXT NOT NULL,
    team_id TEXT NOT NULL,
    points INTEGER NOT NULL DEFAULT 0,
    activities_json TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (event_id, team_id)
);
"#;
