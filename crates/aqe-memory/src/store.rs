use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aqe_config::{MemoryBackendKind, MemoryConfig};
use aqe_core::{AqeError, Event, EventBus, Result, now_millis};

use crate::backend::{MemoryBackend, MemoryEntry, MemoryStats};
use crate::db::ConnectionManager;
use crate::in_memory::InMemoryMemory;
use crate::namespace::Namespace;
use crate::sqlite::SqliteMemory;

/// Namespaced shared memory: the validating facade agents talk to.
///
/// Every key, pattern, and prefix is checked against the namespace before the
/// backend sees it. Expiry is enforced at read time; the reaper only reclaims
/// space.
#[derive(Clone)]
pub struct PersistentMemory {
    backend: Arc<dyn MemoryBackend>,
    namespace: Namespace,
    default_ttl: Option<Duration>,
    events: Option<EventBus>,
}

impl PersistentMemory {
    pub fn new(backend: Arc<dyn MemoryBackend>, namespace: Namespace) -> Self {
        Self {
            backend,
            namespace,
            default_ttl: None,
            events: None,
        }
    }

    /// TTL applied when `store` is called without one.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the backend selected by `[memory].backend`.
    pub fn open(config: &MemoryConfig, db: Option<ConnectionManager>) -> Result<Self> {
        let namespace = Namespace::from_config(config)?;
        let backend: Arc<dyn MemoryBackend> = match config.backend {
            MemoryBackendKind::Sqlite => {
                let db = db.ok_or_else(|| {
                    AqeError::Config("sqlite memory backend needs a database connection".into())
                })?;
                Arc::new(SqliteMemory::new(db))
            }
            MemoryBackendKind::InMemory => Arc::new(InMemoryMemory::new()),
        };
        info!(
            backend = backend.kind(),
            namespace = namespace.root(),
            "shared memory ready"
        );
        Ok(Self::new(backend, namespace)
            .with_default_ttl(config.default_ttl_secs.map(Duration::from_secs)))
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Insert or overwrite `key`. `ttl` overrides the default TTL.
    pub async fn store(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        self.namespace.validate_key(key)?;
        let now = now_millis();
        let expires_at = ttl
            .or(self.default_ttl)
            .map(|ttl| now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64));
        self.backend.put(key, value, now, expires_at).await?;
        debug!(key, ?expires_at, "memory stored");
        self.publish(Event::MemoryStored {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Serialize any `Serialize` value and store it.
    pub async fn store_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store(key, &value, ttl).await
    }

    /// The value at `key`, or `None` when missing or expired.
    pub async fn retrieve(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.retrieve_entry(key).await?.map(|e| e.value))
    }

    pub async fn retrieve_entry(&self, key: &str) -> Result<Option<MemoryEntry>> {
        self.namespace.validate_key(key)?;
        self.backend.get(key, now_millis()).await
    }

    /// Retrieve and deserialize into `T`.
    pub async fn retrieve_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.retrieve(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All live `(key, value)` pairs matching a `*` glob, ordered by key.
    pub async fn search(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .search_entries(pattern)
            .await?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect())
    }

    pub async fn search_entries(&self, pattern: &str) -> Result<Vec<MemoryEntry>> {
        self.namespace.validate_pattern(pattern)?;
        self.backend.search(pattern, now_millis()).await
    }

    /// Idempotent: true only when a row was actually removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.namespace.validate_key(key)?;
        let removed = self.backend.remove(key).await?;
        if removed {
            self.publish(Event::MemoryDeleted {
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    /// Live keys, optionally under a prefix that starts with the namespace.
    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let root = format!("{}/", self.namespace.root());
        let prefix = match prefix {
            Some(p) => {
                self.namespace.validate_prefix(p)?;
                if p == self.namespace.root() { root } else { p.to_string() }
            }
            None => root,
        };
        self.backend.keys(Some(&prefix), now_millis()).await
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.backend.stats(now_millis()).await
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.backend.purge_expired(now_millis()).await?;
        if removed > 0 {
            self.publish(Event::MemoryReaped {
                count: removed as usize,
            });
        }
        Ok(removed)
    }

    /// Periodically purge expired entries until `cancel` fires.
    pub fn spawn_reaper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let memory = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = every.as_secs(), "memory reaper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match memory.purge_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "reaped expired memory entries"),
                            Err(e) => warn!(error = %e, "memory reaper pass failed"),
                        }
                    }
                }
            }
            info!("memory reaper stopped");
        })
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
