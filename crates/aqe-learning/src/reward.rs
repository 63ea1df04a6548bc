//! # Reward calculator
//!
//! `reward = base·difficulty + coverage·Δcov/100 + defect·defects
//!           − min(time_per_sec·overrun, max_time_penalty) − error·[errors > 0]`
//!
//! clamped to `[-clamp, clamp]`. `base` is the success or failure magnitude;
//! only a success is scaled by the difficulty of the state (its complexity
//! bucket), so failing a hard task costs the same as failing an easy one.
//! Absent metrics contribute zero.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aqe_config::RewardWeightsConfig;

use crate::state::StateKey;

/// What happened when an agent executed its chosen action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOutcome {
    pub success: bool,
    /// Coverage gained, in percentage points. Wins over `coverage_before/after`.
    pub coverage_delta: Option<f64>,
    pub coverage_before: Option<f64>,
    pub coverage_after: Option<f64>,
    pub defects_found: Option<f64>,
    pub duration_secs: Option<f64>,
    /// Per-task baseline; the configured baseline applies when absent.
    pub baseline_secs: Option<f64>,
    pub errors: Option<u64>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    /// Lenient conversion from an agent's JSON report. Never fails: fields of
    /// the wrong type are treated as absent.
    pub fn from_value(value: &Value) -> Self {
        let num = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| value.get(n).and_then(Value::as_f64))
                .filter(|n| n.is_finite())
        };
        let success = match value.get("success").or_else(|| value.get("passed")) {
            Some(Value::Bool(b)) => *b,
            _ => matches!(
                value.get("status").and_then(Value::as_str),
                Some("success" | "passed" | "ok")
            ),
        };
        let errors = match value.get("errors") {
            Some(Value::Array(items)) => Some(items.len() as u64),
            Some(v) => v.as_u64(),
            None => None,
        };
        Self {
            success,
            coverage_delta: num(&["coverage_delta", "coverage_gain"]),
            coverage_before: num(&["coverage_before"]),
            coverage_after: num(&["coverage_after", "coverage"]),
            defects_found: num(&["defects_found", "defects", "bugs_found"]),
            duration_secs: num(&["duration_secs", "elapsed_secs"])
                .or_else(|| num(&["duration_ms", "elapsed_ms"]).map(|ms| ms / 1000.0)),
            baseline_secs: num(&["baseline_secs"]),
            errors,
        }
    }

    fn coverage_gain(&self) -> f64 {
        let derived = || match (self.coverage_before, self.coverage_after) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        };
        finite(self.coverage_delta.or_else(derived))
    }
}

fn finite(v: Option<f64>) -> f64 {
    v.filter(|n| n.is_finite()).unwrap_or(0.0)
}

/// Every term of one reward computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub base: f64,
    pub difficulty: f64,
    pub quality: f64,
    pub defects: f64,
    pub time_penalty: f64,
    pub error_penalty: f64,
    /// Sum of the terms before clamping.
    pub raw: f64,
    pub total: f64,
}

/// Pure weighted-sum reward function.
#[derive(Debug, Clone)]
pub struct RewardCalculator {
    weights: RewardWeightsConfig,
}

impl RewardCalculator {
    pub fn new(weights: RewardWeightsConfig) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RewardWeightsConfig {
        &self.weights
    }

    pub fn calculate(&self, outcome: &TaskOutcome, state: &StateKey) -> f64 {
        self.breakdown(outcome, state).total
    }

    pub fn breakdown(&self, outcome: &TaskOutcome, state: &StateKey) -> RewardBreakdown {
        let w = &self.weights;
        let difficulty = difficulty(state);

        let base = if outcome.success {
            w.success * difficulty
        } else {
            w.failure
        };
        let quality = w.coverage * outcome.coverage_gain() / 100.0;
        let defects = w.defect * finite(outcome.defects_found).max(0.0);

        let baseline = finite(outcome.baseline_secs.or(Some(w.baseline_secs)));
        let overrun = (finite(outcome.duration_secs) - baseline).max(0.0);
        let time_penalty = (w.time_per_sec * overrun).min(w.max_time_penalty).max(0.0);

        let error_penalty = if outcome.errors.unwrap_or(0) > 0 {
            w.error
        } else {
            0.0
        };

        let raw = base + quality + defects - time_penalty - error_penalty;
        let total = if raw.is_finite() {
            raw.clamp(-w.clamp, w.clamp)
        } else {
            0.0
        };

        RewardBreakdown {
            base,
            difficulty,
            quality,
            defects,
            time_penalty,
            error_penalty,
            raw,
            total,
        }
    }
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self::new(RewardWeightsConfig::default())
    }
}

/// Success multiplier from the state's complexity bucket.
fn difficulty(state: &StateKey) -> f64 {
    match state.bucket("complexity") {
        Some("medium") => 1.1,
        Some("high") => 1.25,
        Some("very_high") => 1.5,
        _ => 1.0,
    }
}
