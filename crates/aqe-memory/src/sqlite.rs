use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use aqe_core::{AqeError, Result};

use crate::backend::{MemoryBackend, MemoryEntry, MemoryStats};
use crate::db::{ConnectionManager, DbError};
use crate::namespace::{escape_glob, to_sql_glob};

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

type RawEntry = (String, String, i64, i64, i64, Option<i64>);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(raw: RawEntry) -> std::result::Result<MemoryEntry, DbError> {
    let (key, text, size, created, updated, expires) = raw;
    let value: Value = serde_json::from_str(&text).map_err(AqeError::from)?;
    Ok(MemoryEntry::from_millis(
        key,
        value,
        size.max(0) as u64,
        created,
        updated,
        expires,
    ))
}

/// Durable backend over the `memory_entries` table.
#[derive(Clone)]
pub struct SqliteMemory {
    db: ConnectionManager,
}

impl SqliteMemory {
    pub fn new(db: ConnectionManager) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &ConnectionManager {
        &self.db
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemory {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn put(
        &self,
        key: &str,
        value: &Value,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let key = key.to_string();
        let text = serde_json::to_string(value)?;
        self.db
            .interact("memory.store", move |conn| {
                // An expired row being overwritten starts a fresh entry
                conn.execute(
                    "INSERT INTO memory_entries
                       (key, value, size_bytes, created_at, updated_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        size_bytes = excluded.size_bytes,
                        created_at = CASE
                            WHEN memory_entries.expires_at IS NOT NULL
                                 AND memory_entries.expires_at <= excluded.updated_at
                            THEN excluded.created_at
                            ELSE memory_entries.created_at END,
                        updated_at = excluded.updated_at,
                        expires_at = excluded.expires_at",
                    params![key, text, text.len() as i64, now, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, key: &str, now: i64) -> Result<Option<MemoryEntry>> {
        let key = key.to_string();
        self.db
            .interact("memory.retrieve", move |conn| {
                let raw = conn
                    .query_row(
                        &format!(
                            "SELECT key, value, size_bytes, created_at, updated_at, expires_at
                             FROM memory_entries WHERE key = ? AND {LIVE}"
                        ),
                        params![key, now],
                        read_entry,
                    )
                    .optional()?;
                raw.map(decode).transpose()
            })
            .await
    }

    async fn search(&self, pattern: &str, now: i64) -> Result<Vec<MemoryEntry>> {
        let glob = to_sql_glob(pattern);
        self.db
            .interact("memory.search", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key, value, size_bytes, created_at, updated_at, expires_at
                     FROM memory_entries WHERE key GLOB ? AND {LIVE} ORDER BY key"
                ))?;
                let raws = stmt
                    .query_map(params![glob, now], read_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                raws.into_iter().map(decode).collect()
            })
            .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let removed = self
            .db
            .interact("memory.delete", move |conn| {
                Ok(conn.execute("DELETE FROM memory_entries WHERE key = ?1", params![key])?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: Option<&str>, now: i64) -> Result<Vec<String>> {
        let glob = format!("{}*", escape_glob(prefix.unwrap_or("")));
        self.db
            .interact("memory.list_keys", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key FROM memory_entries WHERE key GLOB ? AND {LIVE} ORDER BY key"
                ))?;
                let keys = stmt
                    .query_map(params![glob, now], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(keys)
            })
            .await
    }

    async fn stats(&self, now: i64) -> Result<MemoryStats> {
        self.db
            .interact("memory.stats", move |conn| {
                let (count, size): (i64, i64) = conn.query_row(
                    &format!(
                        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)
                         FROM memory_entries WHERE {LIVE}"
                    ),
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(MemoryStats {
                    entry_count: count.max(0) as u64,
                    total_size_bytes: size.max(0) as u64,
                })
            })
            .await
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let removed = self
            .db
            .interact("memory.purge", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![now],
                )?)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "purged expired memory entries");
        }
        Ok(removed as u64)
    }
}
