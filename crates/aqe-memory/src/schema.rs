use rusqlite::Connection;
use tracing::info;

use crate::db::DbError;

/// Current schema version, tracked through `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const V1: &str = "
CREATE TABLE IF NOT EXISTS agent_types (
    type_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL REFERENCES agent_types(type_id),
    episode INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    UNIQUE(agent_type, episode)
);

CREATE TABLE IF NOT EXISTS q_values (
    agent_type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    action TEXT NOT NULL,
    value REAL NOT NULL,
    visits INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (agent_type, state_key, action)
);

CREATE TABLE IF NOT EXISTS trajectories (
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    seq_index INTEGER NOT NULL,
    state_key TEXT NOT NULL,
    action TEXT NOT NULL,
    reward REAL NOT NULL,
    next_state_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, seq_index)
);

CREATE TABLE IF NOT EXISTS rewards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    agent_type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    action TEXT NOT NULL,
    reward REAL NOT NULL,
    components TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS patterns (
    agent_type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    action TEXT NOT NULL,
    confidence REAL NOT NULL,
    support INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (agent_type, state_key)
);

CREATE TABLE IF NOT EXISTS agent_states (
    agent_type TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_type, episode);
CREATE INDEX IF NOT EXISTS idx_rewards_agent ON rewards(agent_type, created_at);
CREATE INDEX IF NOT EXISTS idx_memory_expires ON memory_entries(expires_at);
";

/// Bring the database up to `SCHEMA_VERSION`. Safe to run on every connect.
pub fn migrate(conn: &mut Connection) -> Result<(), DbError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    // Re-check under the write lock; another process may have migrated meanwhile
    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        tx.execute_batch(V1)?;
    }
    tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    tx.commit()?;

    info!(from = version, to = SCHEMA_VERSION, "database schema migrated");
    Ok(())
}
