use serde::{Deserialize, Serialize};

/// Root configuration, mapped to `aqe.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AqeConfig {
    pub database: DatabaseConfig,
    pub learning: LearningConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

// ── Database ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string: `sqlite://path/to/aqe.db`, a bare path, or `sqlite::memory:`.
    pub dsn: String,
    /// Connections opened eagerly at connect time.
    pub min_pool: usize,
    /// Upper bound on concurrent database sessions.
    pub max_pool: usize,
    /// How long an operation waits for a free pool slot before `ConnectionTimeout`.
    pub connect_timeout_ms: u64,
    /// SQLite busy handler timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// Retries for transient connection failures.
    pub max_retries: u32,
    /// Base delay of the exponential backoff between retries.
    pub retry_base_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://aqe.db".into(),
            min_pool: 2,
            max_pool: 10,
            connect_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_delay_ms: 50,
        }
    }
}

// ── Learning ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Learning rate α (0.0 - 1.0).
    pub alpha: f64,
    /// Discount factor γ (0.0 - 1.0).
    pub gamma: f64,
    pub epsilon: EpsilonConfig,
    pub reward: RewardWeightsConfig,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.95,
            epsilon: EpsilonConfig::default(),
            reward: RewardWeightsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpsilonScheduleKind {
    Constant,
    Linear,
    Exponential,
}

/// Exploration schedule. `decay` is the per-episode step for `linear` and the
/// multiplicative factor for `exponential`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsilonConfig {
    pub schedule: EpsilonScheduleKind,
    pub initial: f64,
    pub min: f64,
    pub decay: f64,
}

impl Default for EpsilonConfig {
    fn default() -> Self {
        Self {
            schedule: EpsilonScheduleKind::Exponential,
            initial: 0.3,
            min: 0.01,
            decay: 0.995,
        }
    }
}

/// Weights of the reward function's terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeightsConfig {
    /// Base reward for a successful task.
    pub success: f64,
    /// Base reward for a failed task (negative).
    pub failure: f64,
    /// Reward per 100 percentage points of coverage gained.
    pub coverage: f64,
    /// Reward per detected defect.
    pub defect: f64,
    /// Duration a task may take before the time penalty starts.
    pub baseline_secs: f64,
    /// Penalty per second of duration beyond the baseline.
    pub time_per_sec: f64,
    /// Cap on the total time penalty.
    pub max_time_penalty: f64,
    /// Hard penalty applied when the task hit execution errors.
    pub error: f64,
    /// Rewards are clamped to `[-clamp, clamp]`.
    pub clamp: f64,
}

impl Default for RewardWeightsConfig {
    fn default() -> Self {
        Self {
            success: 1.0,
            failure: -1.0,
            coverage: 2.0,
            defect: 0.1,
            baseline_secs: 60.0,
            time_per_sec: 0.01,
            max_time_penalty: 1.0,
            error: 2.0,
            clamp: 10.0,
        }
    }
}

// ── Memory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    /// Durable relational backend (SQLite via the connection pool).
    Sqlite,
    /// Process-local cache backend.
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Reserved namespace literal every key must start with.
    pub namespace: String,
    pub backend: MemoryBackendKind,
    /// TTL applied by `store` when the caller passes none (None = never expires).
    pub default_ttl_secs: Option<u64>,
    /// Interval of the background reaper that deletes expired entries (0 = disabled).
    pub reap_interval_secs: u64,
    /// Maximum key length in bytes.
    pub max_key_len: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: "aqe".into(),
            backend: MemoryBackendKind::Sqlite,
            default_ttl_secs: None,
            reap_interval_secs: 60,
            max_key_len: 512,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

fn in_unit_range(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl AqeConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Database ───
        if self.database.dsn.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "database.dsn".into(),
                message: "dsn is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'sqlite://aqe.db'".into()),
            });
        }
        if self.database.max_pool == 0 {
            warnings.push(ConfigWarning {
                field: "database.max_pool".into(),
                message: "max_pool is 0; no connection could ever be acquired".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 10".into()),
            });
        } else if self.database.min_pool > self.database.max_pool {
            warnings.push(ConfigWarning {
                field: "database.min_pool".into(),
                message: format!(
                    "min_pool {} exceeds max_pool {}",
                    self.database.min_pool, self.database.max_pool
                ),
                severity: WarningSeverity::Error,
                hint: Some("Pool bounds default to 2 to 10".into()),
            });
        }
        if self.database.connect_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "database.connect_timeout_ms".into(),
                message: "timeout is 0; callers fail immediately when the pool is busy".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 5000".into()),
            });
        }
        if self.database.max_retries > 10 {
            warnings.push(ConfigWarning {
                field: "database.max_retries".into(),
                message: format!(
                    "{} retries with exponential backoff can stall callers",
                    self.database.max_retries
                ),
                severity: WarningSeverity::Warning,
                hint: Some("3 retries is typical".into()),
            });
        }

        // ── Learning ───
        if !in_unit_range(self.learning.alpha) || self.learning.alpha == 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.alpha".into(),
                message: format!("alpha {} is out of range", self.learning.alpha),
                severity: WarningSeverity::Error,
                hint: Some("Learning rate must be in (0.0, 1.0]".into()),
            });
        }
        if !in_unit_range(self.learning.gamma) {
            warnings.push(ConfigWarning {
                field: "learning.gamma".into(),
                message: format!("gamma {} is out of range", self.learning.gamma),
                severity: WarningSeverity::Error,
                hint: Some("Discount factor must be in [0.0, 1.0]".into()),
            });
        } else if self.learning.gamma == 1.0 {
            warnings.push(ConfigWarning {
                field: "learning.gamma".into(),
                message: "gamma 1.0; values may not converge on long sessions".into(),
                severity: WarningSeverity::Warning,
                hint: Some("0.9 to 0.99 is typical".into()),
            });
        }
        let eps = &self.learning.epsilon;
        if !in_unit_range(eps.initial) || !in_unit_range(eps.min) {
            warnings.push(ConfigWarning {
                field: "learning.epsilon".into(),
                message: format!("epsilon bounds {}..{} are out of range", eps.min, eps.initial),
                severity: WarningSeverity::Error,
                hint: Some("initial and min must be within [0.0, 1.0]".into()),
            });
        } else if eps.min > eps.initial {
            warnings.push(ConfigWarning {
                field: "learning.epsilon.min".into(),
                message: format!("min {} exceeds initial {}", eps.min, eps.initial),
                severity: WarningSeverity::Warning,
                hint: Some("The schedule will stay at min for every episode".into()),
            });
        }
        if eps.schedule == EpsilonScheduleKind::Exponential
            && !(eps.decay > 0.0 && eps.decay <= 1.0)
        {
            warnings.push(ConfigWarning {
                field: "learning.epsilon.decay".into(),
                message: format!("exponential decay factor {} is out of range", eps.decay),
                severity: WarningSeverity::Error,
                hint: Some("Use a factor in (0.0, 1.0], e.g. 0.995".into()),
            });
        }
        if eps.schedule == EpsilonScheduleKind::Linear && eps.decay < 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.epsilon.decay".into(),
                message: "linear decay step is negative; epsilon would grow".into(),
                severity: WarningSeverity::Error,
                hint: Some("Use a small positive step, e.g. 0.001".into()),
            });
        }
        let reward = &self.learning.reward;
        if reward.failure > 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.reward.failure".into(),
                message: format!(
                    "failure reward {} is positive; failures would be reinforced",
                    reward.failure
                ),
                severity: WarningSeverity::Warning,
                hint: Some("The default is -1.0".into()),
            });
        }
        if reward.clamp <= 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.reward.clamp".into(),
                message: "clamp must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("The default is 10.0".into()),
            });
        }
        if reward.baseline_secs < 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.reward.baseline_secs".into(),
                message: format!("baseline {} is negative", reward.baseline_secs),
                severity: WarningSeverity::Error,
                hint: Some("The default is 60.0".into()),
            });
        }

        // ── Memory ───
        let ns = &self.memory.namespace;
        if ns.is_empty() {
            warnings.push(ConfigWarning {
                field: "memory.namespace".into(),
                message: "namespace is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'aqe'".into()),
            });
        } else if ns.contains('/') || ns.contains('*') || ns.chars().any(char::is_whitespace) {
            warnings.push(ConfigWarning {
                field: "memory.namespace".into(),
                message: format!("namespace '{}' must be a single path segment", ns),
                severity: WarningSeverity::Error,
                hint: Some("Remove '/', '*' and whitespace".into()),
            });
        }
        if self.memory.max_key_len <= ns.len() + 1 {
            warnings.push(ConfigWarning {
                field: "memory.max_key_len".into(),
                message: format!(
                    "max_key_len {} leaves no room after the namespace",
                    self.memory.max_key_len
                ),
                severity: WarningSeverity::Error,
                hint: Some("The default is 512".into()),
            });
        }
        if self.memory.default_ttl_secs == Some(0) {
            warnings.push(ConfigWarning {
                field: "memory.default_ttl_secs".into(),
                message: "default TTL of 0 makes every entry expire immediately".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Remove the setting to keep entries until deleted".into()),
            });
        }
        if self.memory.backend == MemoryBackendKind::InMemory {
            warnings.push(ConfigWarning {
                field: "memory.backend".into(),
                message: "in_memory backend is not shared across processes".into(),
                severity: WarningSeverity::Info,
                hint: Some("Use 'sqlite' when agents run in separate processes".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
