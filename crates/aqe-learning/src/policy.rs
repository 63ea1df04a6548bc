use serde::{Deserialize, Serialize};

use aqe_config::{EpsilonConfig, EpsilonScheduleKind};

/// Episode → exploration rate. Owned by the caller; the learner only ever
/// sees the resulting epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "snake_case")]
pub enum EpsilonSchedule {
    Constant { epsilon: f64 },
    /// `initial - step·n`, floored at `min`.
    Linear { initial: f64, min: f64, step: f64 },
    /// `initial · decay^n`, floored at `min`.
    Exponential { initial: f64, min: f64, decay: f64 },
}

impl EpsilonSchedule {
    pub fn from_config(config: &EpsilonConfig) -> Self {
        match config.schedule {
            EpsilonScheduleKind::Constant => EpsilonSchedule::Constant {
                epsilon: config.initial,
            },
            EpsilonScheduleKind::Linear => EpsilonSchedule::Linear {
                initial: config.initial,
                min: config.min,
                step: config.decay,
            },
            EpsilonScheduleKind::Exponential => EpsilonSchedule::Exponential {
                initial: config.initial,
                min: config.min,
                decay: config.decay,
            },
        }
    }

    /// Epsilon after `n` completed episodes, always within `[0, 1]`.
    pub fn epsilon(&self, n: u64) -> f64 {
        let eps = match *self {
            EpsilonSchedule::Constant { epsilon } => epsilon,
            EpsilonSchedule::Linear { initial, min, step } => (initial - step * n as f64).max(min),
            EpsilonSchedule::Exponential { initial, min, decay } => {
                let n = n.min(i32::MAX as u64) as i32;
                (initial * decay.powi(n)).max(min)
            }
        };
        if eps.is_finite() { eps.clamp(0.0, 1.0) } else { 0.0 }
    }

    /// Epsilon for a 1-based session episode number.
    pub fn for_episode(&self, episode: u64) -> f64 {
        self.epsilon(episode.saturating_sub(1))
    }
}

/// Source of randomness for action selection.
pub trait Sampler: Send + Sync {
    /// Uniform draw from `[0, 1)`.
    fn unit(&self) -> f64;

    /// Uniform index in `0..len`. Callers guarantee `len > 0`.
    fn index(&self, len: usize) -> usize;
}

/// Thread-local RNG sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSampler;

impl Sampler for ThreadSampler {
    fn unit(&self) -> f64 {
        rand::random::<f64>()
    }

    fn index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        (rand::random::<u64>() % len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let s = EpsilonSchedule::Constant { epsilon: 0.2 };
        assert_eq!(s.epsilon(0), 0.2);
        assert_eq!(s.epsilon(10_000), 0.2);
    }

    #[test]
    fn test_linear_schedule_floors_at_min() {
        let s = EpsilonSchedule::Linear {
            initial: 0.5,
            min: 0.1,
            step: 0.1,
        };
        assert!((s.epsilon(2) - 0.3).abs() < 1e-12);
        assert_eq!(s.epsilon(100), 0.1);
        assert_eq!(s.for_episode(1), 0.5);
    }

    #[test]
    fn test_exponential_schedule_decays() {
        let s = EpsilonSchedule::from_config(&EpsilonConfig::default());
        assert_eq!(s.epsilon(0), 0.3);
        assert!(s.epsilon(10) < s.epsilon(1));
        assert_eq!(s.epsilon(u64::MAX), 0.01);
    }

    #[test]
    fn test_epsilon_is_clamped() {
        assert_eq!(EpsilonSchedule::Constant { epsilon: 3.0 }.epsilon(0), 1.0);
        assert_eq!(EpsilonSchedule::Constant { epsilon: f64::NAN }.epsilon(0), 0.0);
    }

    #[test]
    fn test_thread_sampler_ranges() {
        let s = ThreadSampler;
        for _ in 0..100 {
            let u = s.unit();
            assert!((0.0..1.0).contains(&u));
            assert!(s.index(3) < 3);
        }
        assert_eq!(s.index(1), 0);
    }
}
