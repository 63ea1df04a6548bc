use thiserror::Error;

/// Unified error type for the learning and shared-memory subsystem.
#[derive(Error, Debug)]
pub enum AqeError {
    // ── Validation ─────────────────────────────────────────────
    #[error("validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    // ── Connection errors ──────────────────────────────────────
    #[error("connection timeout during {operation} after {waited_ms}ms")]
    ConnectionTimeout { operation: String, waited_ms: u64 },

    #[error("connection error during {operation}: {reason}")]
    Connection { operation: String, reason: String },

    // ── Store errors ───────────────────────────────────────────
    #[error("constraint violation on {entity}: {reason}")]
    ConstraintViolation { entity: String, reason: String },

    #[error("storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AqeError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn constraint(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures are retried by the connection manager; everything
    /// else is surfaced to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AqeError::ConnectionTimeout { .. } | AqeError::Connection { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AqeError::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, AqeError>;
