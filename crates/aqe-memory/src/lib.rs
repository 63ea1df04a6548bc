//! # aqe-memory
//!
//! Persistence layer shared by every AQE agent:
//!
//! - **Connection manager**: a bounded pool of SQLite connections with
//!   parameterized statements, bounded waits, and retry of transient failures.
//! - **Schema**: the relational tables behind Q-learning and shared memory.
//! - **Persistent memory**: a namespaced key-value blackboard with TTL support,
//!   backed either by the relational store or by a process-local cache.
//!
//! The relational store is the single source of truth; all atomicity is
//! delegated to its upsert and transaction primitives.

pub mod backend;
pub mod db;
pub mod in_memory;
pub mod namespace;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use backend::{MemoryBackend, MemoryEntry, MemoryStats};
pub use db::{ConnectionManager, DbError, PoolStatus, RetryPolicy, Row, SqlValue};
pub use in_memory::InMemoryMemory;
pub use namespace::{Namespace, glob_match};
pub use sqlite::SqliteMemory;
pub use store::PersistentMemory;
