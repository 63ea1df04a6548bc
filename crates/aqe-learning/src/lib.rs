//! # aqe-learning
//!
//! Tabular Q-learning for AQE agents, persisted through the shared relational
//! store so every agent in the fleet learns from the same table.

pub mod cycle;
pub mod learner;
pub mod policy;
pub mod q_table;
pub mod reward;
pub mod session;
pub mod state;
pub mod trajectory;

pub use cycle::{CyclePhase, DecisionCycle};
pub use learner::{
    ActionChoice, Experience, LearnOutcome, LearnedUpdate, LearningRates, Observation, Policy,
    QLearner, SkipReason, TrajectoryStatus,
};
pub use policy::{EpsilonSchedule, Sampler, ThreadSampler};
pub use q_table::{Pattern, QTableStore, QUpdate};
pub use reward::{RewardBreakdown, RewardCalculator, TaskOutcome};
pub use session::SessionManager;
pub use state::{Feature, StateEncoder, StateKey};
pub use trajectory::TrajectoryRecorder;
