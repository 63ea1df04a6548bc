use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use aqe_core::Result;

use crate::backend::{MemoryBackend, MemoryEntry, MemoryStats, is_live};
use crate::namespace::glob_match;

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    size_bytes: u64,
    created_at: i64,
    updated_at: i64,
    expires_at: Option<i64>,
}

impl Slot {
    fn entry(&self, key: &str) -> MemoryEntry {
        MemoryEntry::from_millis(
            key.to_string(),
            self.value.clone(),
            self.size_bytes,
            self.created_at,
            self.updated_at,
            self.expires_at,
        )
    }
}

/// Process-local cache backend. Fast, lost on restart, shared by every
/// `PersistentMemory` handle cloned from the same instance.
#[derive(Debug, Default)]
pub struct InMemoryMemory {
    entries: DashMap<String, Slot>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryMemory {
    fn kind(&self) -> &'static str {
        "in_memory"
    }

    async fn put(
        &self,
        key: &str,
        value: &Value,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let size_bytes = serde_json::to_string(value)?.len() as u64;
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Null,
            size_bytes: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        });
        if !is_live(slot.expires_at, now) {
            slot.created_at = now;
        }
        slot.value = value.clone();
        slot.size_bytes = size_bytes;
        slot.updated_at = now;
        slot.expires_at = expires_at;
        Ok(())
    }

    async fn get(&self, key: &str, now: i64) -> Result<Option<MemoryEntry>> {
        Ok(self
            .entries
            .get(key)
            .filter(|slot| is_live(slot.expires_at, now))
            .map(|slot| slot.entry(key)))
    }

    async fn search(&self, pattern: &str, now: i64) -> Result<Vec<MemoryEntry>> {
        let mut found: Vec<MemoryEntry> = self
            .entries
            .iter()
            .filter(|e| is_live(e.expires_at, now) && glob_match(pattern, e.key()))
            .map(|e| e.value().entry(e.key()))
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self, prefix: Option<&str>, now: i64) -> Result<Vec<String>> {
        let prefix = prefix.unwrap_or("");
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| is_live(e.expires_at, now) && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self, now: i64) -> Result<MemoryStats> {
        let mut stats = MemoryStats::default();
        for e in self.entries.iter().filter(|e| is_live(e.expires_at, now)) {
            stats.entry_count += 1;
            stats.total_size_bytes += e.size_bytes;
        }
        Ok(stats)
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut removed = 0u64;
        self.entries.retain(|_, slot| {
            let keep = is_live(slot.expires_at, now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
