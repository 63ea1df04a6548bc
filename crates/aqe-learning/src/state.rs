//! # State encoder
//!
//! Maps a task's execution context (a JSON object of code metrics, history and
//! configuration) onto a handful of discretized features and joins them into a
//! canonical key (a single line, wrapped here):
//!
//! ```text
//! attempt=first|complexity=high|coverage_gap=medium|prior_failure=no|size=small|
//!     task_type=test_generation|time_pressure=relaxed
//! ```
//!
//! Encoding is total. A feature whose input is missing or unusable falls into
//! its `unknown` bucket, so the key space stays bounded by the product of the
//! per-feature bucket counts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bucket used when a feature's input is absent or malformed.
pub const UNKNOWN: &str = "unknown";

const TASK_TYPES: &[&str] = &[
    "accessibility",
    "api_contract",
    "chaos",
    "coverage_analysis",
    "flaky_detection",
    "performance",
    "quality_gate",
    "regression",
    "security",
    "test_generation",
    "visual",
    "other",
];

const COMPLEXITY_KEYS: &[&str] = &[
    "complexity",
    "cyclomatic_complexity",
    "metrics.complexity",
    "metrics.cyclomatic_complexity",
];

/// Canonical encoding of a task context, used to index learned values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    /// Wrap an already-encoded key, e.g. one read back from storage.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bucket recorded for `feature`, if the key carries it.
    pub fn bucket(&self, feature: &str) -> Option<&str> {
        self.0.split('|').find_map(|pair| {
            let (name, bucket) = pair.split_once('=')?;
            (name == feature).then_some(bucket)
        })
    }

    /// Short stable hash for log lines.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.0.as_bytes()).to_hex().as_str()[..16].to_string()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StateKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<StateKey> for String {
    fn from(key: StateKey) -> Self {
        key.0
    }
}

/// A discretized input to the state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    Attempt,
    Complexity,
    CoverageGap,
    PriorFailure,
    Size,
    TaskType,
    TimePressure,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::Attempt,
        Feature::Complexity,
        Feature::CoverageGap,
        Feature::PriorFailure,
        Feature::Size,
        Feature::TaskType,
        Feature::TimePressure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::Attempt => "attempt",
            Feature::Complexity => "complexity",
            Feature::CoverageGap => "coverage_gap",
            Feature::PriorFailure => "prior_failure",
            Feature::Size => "size",
            Feature::TaskType => "task_type",
            Feature::TimePressure => "time_pressure",
        }
    }

    /// Every bucket this feature can produce, `unknown` excluded.
    pub fn buckets(self) -> &'static [&'static str] {
        match self {
            Feature::Attempt => &["first", "retry", "many"],
            Feature::Complexity => &["low", "medium", "high", "very_high"],
            Feature::CoverageGap => &["none", "small", "medium", "large"],
            Feature::PriorFailure => &["no", "yes"],
            Feature::Size => &["tiny", "small", "medium", "large"],
            Feature::TaskType => TASK_TYPES,
            Feature::TimePressure => &["tight", "moderate", "relaxed"],
        }
    }

    /// Discretize this feature from `ctx`.
    pub fn bucket(self, ctx: &Value) -> &'static str {
        match self {
            Feature::Attempt => attempt_bucket(ctx),
            Feature::Complexity => first_number(ctx, COMPLEXITY_KEYS)
                .filter(|n| *n >= 0.0)
                .map_or(UNKNOWN, |n| {
                    threshold(n, [5.0, 10.0, 20.0], ["low", "medium", "high", "very_high"])
                }),
            Feature::CoverageGap => coverage_percent(ctx)
                .map_or(UNKNOWN, |c| {
                    threshold(100.0 - c, [5.0, 20.0, 50.0], ["none", "small", "medium", "large"])
                }),
            Feature::PriorFailure => prior_failure_bucket(ctx),
            Feature::Size => first_number(ctx, &[
                "lines_of_code",
                "loc",
                "size",
                "metrics.lines_of_code",
                "metrics.loc",
            ])
            .filter(|n| *n >= 0.0)
            .map_or(UNKNOWN, |n| {
                threshold(n, [100.0, 1_000.0, 10_000.0], ["tiny", "small", "medium", "large"])
            }),
            Feature::TaskType => task_type_bucket(ctx),
            Feature::TimePressure => time_budget_secs(ctx)
                .filter(|n| *n >= 0.0)
                .map_or(UNKNOWN, |n| {
                    if n < 60.0 {
                        "tight"
                    } else if n < 600.0 {
                        "moderate"
                    } else {
                        "relaxed"
                    }
                }),
        }
    }
}

fn threshold(n: f64, bounds: [f64; 3], names: [&'static str; 4]) -> &'static str {
    bounds
        .iter()
        .position(|b| n < *b)
        .map_or(names[3], |i| names[i])
}

/// Resolve a dotted path; a literal key containing dots wins over descent.
fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = ctx.get(path) {
        return Some(v);
    }
    path.split('.').try_fold(ctx, |node, segment| node.get(segment))
}

fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn first_number(ctx: &Value, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|path| lookup(ctx, path).and_then(as_number))
}

fn coverage_percent(ctx: &Value) -> Option<f64> {
    let percent = first_number(ctx, &[
        "coverage",
        "coverage_percent",
        "metrics.coverage",
        "coverage.line",
        "coverage.lines",
    ]);
    let ratio = || {
        first_number(ctx, &["coverage_ratio", "metrics.coverage_ratio"]).map(|r| r * 100.0)
    };
    percent
        .or_else(ratio)
        .filter(|c| (0.0..=100.0).contains(c))
}

fn time_budget_secs(ctx: &Value) -> Option<f64> {
    first_number(ctx, &[
        "time_budget_secs",
        "deadline_secs",
        "timeout_secs",
        "budget.seconds",
    ])
    .or_else(|| first_number(ctx, &["time_budget_ms", "timeout_ms"]).map(|ms| ms / 1000.0))
}

fn attempt_bucket(ctx: &Value) -> &'static str {
    // retry counters are zero-based, attempt numbers one-based
    let attempt = first_number(ctx, &["attempt", "attempt_number"])
        .or_else(|| first_number(ctx, &["retry_count", "retries"]).map(|r| r + 1.0));
    match attempt {
        Some(n) if n < 0.0 => UNKNOWN,
        Some(n) if n < 2.0 => "first",
        Some(n) if n < 4.0 => "retry",
        Some(_) => "many",
        None => UNKNOWN,
    }
}

fn prior_failure_bucket(ctx: &Value) -> &'static str {
    const ALIASES: &[&str] = &[
        "prior_failure",
        "previous_failure",
        "failed_before",
        "history.failed",
        "history.prior_failures",
        "history.failures",
    ];
    for path in ALIASES {
        let flag = match lookup(ctx, path) {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::Number(n)) => n.as_f64().map(|n| n > 0.0),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Some(Value::Array(items)) => Some(!items.is_empty()),
            _ => None,
        };
        if let Some(flag) = flag {
            return if flag { "yes" } else { "no" };
        }
    }
    UNKNOWN
}

fn task_type_bucket(ctx: &Value) -> &'static str {
    let Some(raw) = ["task_type", "task.type", "type"]
        .iter()
        .find_map(|path| lookup(ctx, path))
    else {
        return UNKNOWN;
    };
    let Some(name) = raw.as_str() else {
        return "other";
    };
    let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    TASK_TYPES
        .iter()
        .find(|t| **t == normalized)
        .copied()
        .unwrap_or("other")
}

/// Deterministic context → state-key encoder over a fixed feature set.
#[derive(Debug, Clone)]
pub struct StateEncoder {
    features: Vec<Feature>,
}

impl StateEncoder {
    /// Encoder over a subset of features. Order and duplicates don't matter.
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        let mut features: Vec<Feature> = features.into_iter().collect();
        features.sort_by_key(|f| f.name());
        features.dedup();
        Self { features }
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Feature name → bucket for `ctx`, ordered by name.
    pub fn buckets(&self, ctx: &Value) -> BTreeMap<&'static str, &'static str> {
        self.features
            .iter()
            .map(|f| (f.name(), f.bucket(ctx)))
            .collect()
    }

    pub fn encode(&self, ctx: &Value) -> StateKey {
        let key = self
            .features
            .iter()
            .map(|f| format!("{}={}", f.name(), f.bucket(ctx)))
            .collect::<Vec<_>>()
            .join("|");
        StateKey(key)
    }

    /// Upper bound on distinct keys this encoder can produce.
    pub fn cardinality(&self) -> u64 {
        self.features
            .iter()
            .map(|f| f.buckets().len() as u64 + 1)
            .product()
    }
}

impl Default for StateEncoder {
    fn default() -> Self {
        Self::new(Feature::ALL)
    }
}
