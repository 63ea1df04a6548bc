//! # Connection manager
//!
//! Owns a bounded pool of SQLite connections (`deadpool::managed` over
//! `rusqlite`). Every statement is parameterized and bound positionally.
//!
//! - Acquisition suspends only the calling task until a slot frees up or the
//!   configured wait elapses, which surfaces as `ConnectionTimeout`.
//! - Broken connections fail recycling and are reopened lazily on the next
//!   acquisition.
//! - Transient failures (pool wait timeout, busy/locked database, failed
//!   connection open) are retried with bounded exponential backoff.
//!
//! Blocking SQLite work runs on the tokio blocking pool so agents sharing a
//! runtime never stall each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::Runtime;
use deadpool::managed::{Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use aqe_config::DatabaseConfig;
use aqe_core::AqeError;

/// A dynamically typed SQL value, used by the generic `execute`/`fetch` primitives.
pub type SqlValue = rusqlite::types::Value;

/// A fetched row: column values in select order.
pub type Row = Vec<SqlValue>;

/// Error returned from closures run against a pooled connection.
///
/// Closures can fail with a raw SQLite error (classified by the manager) or
/// with a domain error that is passed through untouched.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Domain(#[from] AqeError),
}

// ── Target / connector ─────────────────────────────────────────

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Shared-cache in-memory database URI, unique per manager.
    Memory(String),
}

impl Target {
    fn parse(dsn: &str) -> aqe_core::Result<Self> {
        let dsn = dsn.trim();
        if matches!(dsn, "sqlite::memory:" | ":memory:" | "sqlite://:memory:") {
            return Ok(Target::Memory(format!(
                "file:aqe-{}?mode=memory&cache=shared",
                Uuid::new_v4().simple()
            )));
        }
        if dsn.contains("://") && !dsn.starts_with("sqlite://") {
            return Err(AqeError::validation(
                "database.dsn",
                format!("unsupported scheme in '{dsn}' (expected sqlite://)"),
            ));
        }
        let path = dsn
            .strip_prefix("sqlite://")
            .or_else(|| dsn.strip_prefix("sqlite:"))
            .unwrap_or(dsn);
        if path.is_empty() {
            return Err(AqeError::validation("database.dsn", "no database path given"));
        }
        Ok(Target::File(PathBuf::from(path)))
    }
}

/// deadpool manager that opens configured SQLite connections.
pub struct SqliteConnector {
    target: Target,
    busy_timeout: Duration,
}

impl SqliteConnector {
    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.target {
            Target::File(path) => Connection::open(path)?,
            Target::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        // WAL lets readers proceed while one writer holds the lock
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }
}

impl Manager for SqliteConnector {
    type Type = Connection;
    type Error = rusqlite::Error;

    async fn create(&self) -> Result<Connection, rusqlite::Error> {
        debug!(target = ?self.target, "opening database connection");
        self.open()
    }

    async fn recycle(&self, conn: &mut Connection, _: &Metrics) -> RecycleResult<rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(RecycleError::Backend)
    }
}

// ── Retry policy ───────────────────────────────────────────────

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Whether the given retry number (0-indexed) is within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry `attempt`: base · 2^attempt, capped, plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms
            .saturating_mul(1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX))
            .min(self.max_delay.as_millis() as u64);
        let jitter_ms = rand::random::<u64>() % (exp_ms / 4 + 1);
        Duration::from_millis(exp_ms + jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DatabaseConfig::default())
    }
}

// ── Manager ────────────────────────────────────────────────────

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
    pub closed: bool,
}

struct Inner {
    pool: Pool<SqliteConnector>,
    retry: RetryPolicy,
    dsn: String,
}

/// Pooled, cloneable handle to the relational store.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Establish a pool with the given bounds and default timeouts, then apply migrations.
    pub async fn connect(dsn: &str, min_pool: usize, max_pool: usize) -> aqe_core::Result<Self> {
        let config = DatabaseConfig {
            dsn: dsn.to_string(),
            min_pool,
            max_pool,
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Establish a pool from the `[database]` config section, then apply migrations.
    pub async fn from_config(config: &DatabaseConfig) -> aqe_core::Result<Self> {
        if config.max_pool == 0 {
            return Err(AqeError::validation("database.max_pool", "must be at least 1"));
        }
        if config.min_pool > config.max_pool {
            return Err(AqeError::validation(
                "database.min_pool",
                format!("{} exceeds max_pool {}", config.min_pool, config.max_pool),
            ));
        }

        let target = Target::parse(&config.dsn)?;
        if let Target::File(path) = &target {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        info!(
            dsn = %config.dsn,
            min = config.min_pool,
            max = config.max_pool,
            "opening connection pool"
        );

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let connector = SqliteConnector {
            target,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        };
        let pool = Pool::builder(connector)
            .max_size(config.max_pool)
            .wait_timeout(Some(timeout))
            .create_timeout(Some(timeout))
            .recycle_timeout(Some(timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| AqeError::Connection {
                operation: "db.connect".into(),
                reason: e.to_string(),
            })?;

        let manager = Self {
            inner: Arc::new(Inner {
                pool,
                retry: RetryPolicy::from_config(config),
                dsn: config.dsn.clone(),
            }),
        };

        manager.warm(config.min_pool).await?;
        manager
            .interact("schema.migrate", |conn| crate::schema::migrate(conn))
            .await?;

        Ok(manager)
    }

    /// Open `min` connections up front so the first callers don't pay for it.
    async fn warm(&self, min: usize) -> aqe_core::Result<()> {
        let mut held = Vec::with_capacity(min);
        for _ in 0..min {
            held.push(self.acquire("db.connect").await?);
        }
        debug!(warmed = held.len(), "connection pool warmed");
        Ok(())
    }

    /// Close the pool. Idle connections are dropped now, in-flight ones when
    /// they are returned; later calls fail with a `Connection` error.
    pub fn disconnect(&self) {
        info!(dsn = %self.inner.dsn, "closing connection pool");
        self.inner.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    pub fn dsn(&self) -> &str {
        &self.inner.dsn
    }

    pub fn status(&self) -> PoolStatus {
        let s = self.inner.pool.status();
        PoolStatus {
            max_size: s.max_size,
            size: s.size,
            available: s.available,
            closed: self.is_closed(),
        }
    }

    async fn acquire(&self, operation: &str) -> aqe_core::Result<Object<SqliteConnector>> {
        let started = Instant::now();
        self.inner
            .pool
            .get()
            .await
            .map_err(|e| pool_error(operation, e, started.elapsed()))
    }

    /// Run a closure against a pooled connection on the blocking pool.
    ///
    /// Transient failures are retried, so the closure must be safe to run more
    /// than once (idempotent statements or a single transaction).
    pub async fn interact<F, T>(&self, operation: &'static str, f: F) -> aqe_core::Result<T>
    where
        F: Fn(&mut Connection) -> Result<T, DbError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0u32;
        loop {
            match self.interact_once(operation, Arc::clone(&f)).await {
                Err(e)
                    if e.is_transient()
                        && !self.is_closed()
                        && self.inner.retry.should_retry(attempt) =>
                {
                    let delay = self.inner.retry.delay(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient database failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn interact_once<F, T>(&self, operation: &'static str, f: Arc<F>) -> aqe_core::Result<T>
    where
        F: Fn(&mut Connection) -> Result<T, DbError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let mut obj = self.acquire(operation).await?;
        tokio::task::spawn_blocking(move || {
            let conn: &mut Connection = &mut obj;
            f(conn)
        })
        .await
        .map_err(|e| AqeError::storage(operation, format!("blocking task failed: {e}")))?
        .map_err(|e| classify(operation, e))
    }

    /// Run a closure inside an `IMMEDIATE` transaction. The write lock is taken
    /// up front so read-modify-write sequences inside serialize across agents.
    pub async fn transaction<F, T>(&self, operation: &'static str, f: F) -> aqe_core::Result<T>
    where
        F: Fn(&Transaction<'_>) -> Result<T, DbError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.interact(operation, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Execute a parameterized statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> aqe_core::Result<usize> {
        let sql = sql.to_string();
        self.interact("db.execute", move |conn| {
            Ok(conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?)
        })
        .await
    }

    /// Run a parameterized query and return every row.
    pub async fn fetch(&self, sql: &str, params: Vec<SqlValue>) -> aqe_core::Result<Vec<Row>> {
        let sql = sql.to_string();
        self.interact("db.fetch", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let width = stmt.column_count();
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    (0..width)
                        .map(|i| row.get::<_, SqlValue>(i))
                        .collect::<rusqlite::Result<Row>>()
                })?
                .collect::<rusqlite::Result<Vec<Row>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Run a parameterized query and return the first row, if any.
    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> aqe_core::Result<Option<Row>> {
        Ok(self.fetch(sql, params).await?.into_iter().next())
    }
}

fn pool_error(operation: &str, err: PoolError<rusqlite::Error>, waited: Duration) -> AqeError {
    match err {
        PoolError::Timeout(_) => AqeError::ConnectionTimeout {
            operation: operation.to_string(),
            waited_ms: waited.as_millis() as u64,
        },
        PoolError::Closed => AqeError::Connection {
            operation: operation.to_string(),
            reason: "connection pool is closed".into(),
        },
        other => AqeError::Connection {
            operation: operation.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Map a closure failure onto the error taxonomy.
fn classify(operation: &str, err: DbError) -> AqeError {
    let e = match err {
        DbError::Domain(e) => return e,
        DbError::Sql(e) => e,
    };
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                return AqeError::Connection {
                    operation: operation.to_string(),
                    reason: e.to_string(),
                };
            }
            ErrorCode::ConstraintViolation => {
                return AqeError::ConstraintViolation {
                    entity: operation.to_string(),
                    reason: e.to_string(),
                };
            }
            _ => {}
        }
    }
    AqeError::storage(operation, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn_forms() {
        assert!(matches!(Target::parse("sqlite::memory:").unwrap(), Target::Memory(_)));
        match Target::parse("sqlite:///var/lib/aqe/fleet.db").unwrap() {
            Target::File(p) => assert_eq!(p, PathBuf::from("/var/lib/aqe/fleet.db")),
            other => panic!("unexpected target {other:?}"),
        }
        match Target::parse("data/aqe.db").unwrap() {
            Target::File(p) => assert_eq!(p, PathBuf::from("data/aqe.db")),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_parse_dsn_rejects_foreign_scheme_and_empty() {
        assert!(Target::parse("postgres://localhost/aqe").unwrap_err().is_validation());
        assert!(Target::parse("sqlite://").unwrap_err().is_validation());
    }

    #[test]
    fn test_memory_targets_are_unique() {
        let (Target::Memory(a), Target::Memory(b)) =
            (Target::parse(":memory:").unwrap(), Target::parse(":memory:").unwrap())
        else {
            panic!("expected memory targets");
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let d0 = policy.delay(0).as_millis();
        let d2 = policy.delay(2).as_millis();
        let d10 = policy.delay(10).as_millis();
        assert!((100..=125).contains(&d0));
        assert!((400..=500).contains(&d2));
        assert!((1000..=1250).contains(&d10));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_classify_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(classify("q_table.upsert", DbError::Sql(busy)).is_transient());
    }

    #[test]
    fn test_classify_passes_domain_errors_through() {
        let err = classify(
            "session.close",
            DbError::Domain(AqeError::constraint("session", "already closed")),
        );
        assert!(matches!(err, AqeError::ConstraintViolation { .. }));
    }
}
