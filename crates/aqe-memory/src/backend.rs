use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use aqe_core::Result;
use aqe_core::types::datetime_from_millis;

/// A stored shared-memory value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub(crate) fn from_millis(
        key: String,
        value: Value,
        size_bytes: u64,
        created_at: i64,
        updated_at: i64,
        expires_at: Option<i64>,
    ) -> Self {
        Self {
            key,
            value,
            size_bytes,
            created_at: datetime_from_millis(created_at),
            updated_at: datetime_from_millis(updated_at),
            expires_at: expires_at.map(datetime_from_millis),
        }
    }
}

/// Aggregate counters over live (non-expired) entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub entry_count: u64,
    pub total_size_bytes: u64,
}

/// Storage capability behind `PersistentMemory`.
///
/// Backends trust their inputs: keys and patterns arrive validated, and `now`
/// (epoch milliseconds) is supplied by the caller so expiry is decided in one
/// place. An entry is live while `expires_at` is absent or later than `now`.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Short backend name for logs and `stats` output.
    fn kind(&self) -> &'static str;

    /// Insert or overwrite `key`, keeping the original `created_at` on overwrite.
    async fn put(&self, key: &str, value: &Value, now: i64, expires_at: Option<i64>)
    -> Result<()>;

    async fn get(&self, key: &str, now: i64) -> Result<Option<MemoryEntry>>;

    /// Live entries whose key matches the `*` glob, ordered by key.
    async fn search(&self, pattern: &str, now: i64) -> Result<Vec<MemoryEntry>>;

    /// Remove the row regardless of expiry; true when something was removed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Live keys, optionally restricted to a literal prefix, ordered.
    async fn keys(&self, prefix: Option<&str>, now: i64) -> Result<Vec<String>>;

    async fn stats(&self, now: i64) -> Result<MemoryStats>;

    /// Physically delete expired rows; returns how many were removed.
    async fn purge_expired(&self, now: i64) -> Result<u64>;
}

pub(crate) fn is_live(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.is_none_or(|at| at > now)
}
