//! # Q-learner
//!
//! Epsilon-greedy action selection and the temporal-difference update over the
//! shared Q-table.
//!
//! Learning never aborts an agent's task:
//! - `choose_action` falls back to a uniformly random candidate when the store
//!   is unreachable (`Policy::Degraded`) or the state is unvisited
//!   (`Policy::ColdStart`).
//! - `update` reports failures as `LearnOutcome::Skipped` instead of an error.
//! - A failed trajectory append after a successful value write is carried as
//!   a warning inside `LearnOutcome::Learned`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use aqe_config::LearningConfig;
use aqe_core::{Action, AgentType, AqeError, Event, EventBus, Result, SessionId};
use aqe_memory::ConnectionManager;

use crate::policy::{Sampler, ThreadSampler};
use crate::q_table::{QTableStore, QUpdate};
use crate::reward::{RewardBreakdown, RewardCalculator, TaskOutcome};
use crate::state::{StateEncoder, StateKey};
use crate::trajectory::TrajectoryRecorder;

/// How an action was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Random candidate, drawn with probability epsilon.
    Explore,
    /// Highest stored value among the candidates.
    Exploit,
    /// No candidate has a stored value yet; random candidate.
    ColdStart,
    /// The store could not be read; random candidate.
    Degraded,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Explore => "explore",
            Policy::Exploit => "exploit",
            Policy::ColdStart => "cold_start",
            Policy::Degraded => "degraded",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionChoice {
    pub action: Action,
    pub state: StateKey,
    pub policy: Policy,
    /// Stored value of `action` when the choice was greedy.
    pub value: Option<f64>,
}

/// Learning rate and discount factor, passed explicitly on every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    pub alpha: f64,
    pub gamma: f64,
}

impl LearningRates {
    pub fn new(alpha: f64, gamma: f64) -> Result<Self> {
        let rates = Self { alpha, gamma };
        rates.validate()?;
        Ok(rates)
    }

    pub fn from_config(config: &LearningConfig) -> Self {
        Self {
            alpha: config.alpha,
            gamma: config.gamma,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(AqeError::validation("alpha", format!("{} is outside (0, 1]", self.alpha)));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(AqeError::validation("gamma", format!("{} is outside [0, 1]", self.gamma)));
        }
        Ok(())
    }
}

/// One observed transition to learn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub session_id: SessionId,
    pub state: StateKey,
    pub action: Action,
    pub reward: f64,
    pub next_state: StateKey,
    /// Actions available in `next_state`; empty for a terminal transition.
    pub next_actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TrajectoryStatus {
    Recorded(u64),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedUpdate {
    pub update: QUpdate,
    pub trajectory: TrajectoryStatus,
}

impl LearnedUpdate {
    pub fn warning(&self) -> Option<&str> {
        match &self.trajectory {
            TrajectoryStatus::Failed(reason) => Some(reason),
            TrajectoryStatus::Recorded(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    InvalidInput(String),
    StoreUnavailable(String),
    StoreFailure(String),
}

impl SkipReason {
    fn from_error(err: &AqeError) -> Self {
        if err.is_transient() {
            SkipReason::StoreUnavailable(err.to_string())
        } else if err.is_validation() {
            SkipReason::InvalidInput(err.to_string())
        } else {
            SkipReason::StoreFailure(err.to_string())
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidInput(r) => write!(f, "invalid input: {r}"),
            SkipReason::StoreUnavailable(r) => write!(f, "store unavailable: {r}"),
            SkipReason::StoreFailure(r) => write!(f, "store failure: {r}"),
        }
    }
}

/// Result of a best-effort update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum LearnOutcome {
    Learned(LearnedUpdate),
    Skipped(SkipReason),
}

impl LearnOutcome {
    pub fn is_learned(&self) -> bool {
        matches!(self, LearnOutcome::Learned(_))
    }

    pub fn learned(&self) -> Option<&LearnedUpdate> {
        match self {
            LearnOutcome::Learned(u) => Some(u),
            LearnOutcome::Skipped(_) => None,
        }
    }

    /// Anything the caller may want to log: the skip reason or a trajectory failure.
    pub fn warning(&self) -> Option<String> {
        match self {
            LearnOutcome::Learned(u) => {
                u.warning().map(|w| format!("trajectory not recorded: {w}"))
            }
            LearnOutcome::Skipped(reason) => Some(reason.to_string()),
        }
    }
}

/// An outcome turned into a reward and learned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub reward: RewardBreakdown,
    pub next_state: StateKey,
    pub outcome: LearnOutcome,
}

/// Stateless epsilon-greedy Q-learner over the shared table.
#[derive(Clone)]
pub struct QLearner {
    q_table: QTableStore,
    trajectories: TrajectoryRecorder,
    encoder: StateEncoder,
    rewards: RewardCalculator,
    sampler: Arc<dyn Sampler>,
    events: Option<EventBus>,
}

impl QLearner {
    pub fn new(db: ConnectionManager, config: &LearningConfig) -> Self {
        Self {
            q_table: QTableStore::new(db.clone()),
            trajectories: TrajectoryRecorder::new(db),
            encoder: StateEncoder::default(),
            rewards: RewardCalculator::new(config.reward.clone()),
            sampler: Arc::new(ThreadSampler),
            events: None,
        }
    }

    pub fn with_encoder(mut self, encoder: StateEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.trajectories = self.trajectories.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn q_table(&self) -> &QTableStore {
        &self.q_table
    }

    pub fn trajectories(&self) -> &TrajectoryRecorder {
        &self.trajectories
    }

    pub fn encoder(&self) -> &StateEncoder {
        &self.encoder
    }

    pub fn rewards(&self) -> &RewardCalculator {
        &self.rewards
    }

    pub fn encode(&self, context: &Value) -> StateKey {
        self.encoder.encode(context)
    }

    /// Encode `context` and pick one of `candidates`.
    ///
    /// Only malformed input (no candidates, epsilon outside `[0, 1]`) is an
    /// error; store trouble degrades to a random pick.
    pub async fn choose_action(
        &self,
        agent: &AgentType,
        context: &Value,
        candidates: &[Action],
        epsilon: f64,
    ) -> Result<ActionChoice> {
        self.choose_for_state(agent, self.encode(context), candidates, epsilon)
            .await
    }

    /// `choose_action` for an already-encoded state.
    pub async fn choose_for_state(
        &self,
        agent: &AgentType,
        state: StateKey,
        candidates: &[Action],
        epsilon: f64,
    ) -> Result<ActionChoice> {
        if candidates.is_empty() {
            return Err(AqeError::validation(
                "candidates",
                "at least one candidate action is required",
            ));
        }
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(AqeError::validation("epsilon", format!("{epsilon} is outside [0, 1]")));
        }

        let choice = if epsilon > 0.0 && self.sampler.unit() < epsilon {
            self.random_choice(state, candidates, Policy::Explore)
        } else {
            match self.q_table.best_action(agent, &state, candidates).await {
                Ok(Some((action, value))) => ActionChoice {
                    action,
                    state,
                    policy: Policy::Exploit,
                    value: Some(value),
                },
                Ok(None) => self.random_choice(state, candidates, Policy::ColdStart),
                Err(e) => {
                    warn!(
                        agent_type = %agent,
                        error = %e,
                        "q-table unavailable, choosing at random"
                    );
                    self.random_choice(state, candidates, Policy::Degraded)
                }
            }
        };

        debug!(
            agent_type = %agent,
            state = %choice.state.fingerprint(),
            action = %choice.action,
            policy = %choice.policy,
            "action chosen"
        );
        self.publish(Event::ActionChosen {
            agent_type: agent.to_string(),
            state_key: choice.state.to_string(),
            action: choice.action.clone(),
            policy: choice.policy.to_string(),
        });
        Ok(choice)
    }

    fn random_choice(
        &self,
        state: StateKey,
        candidates: &[Action],
        policy: Policy,
    ) -> ActionChoice {
        let i = self.sampler.index(candidates.len()).min(candidates.len() - 1);
        ActionChoice {
            action: candidates[i].clone(),
            state,
            policy,
            value: None,
        }
    }

    /// Apply the TD update for `experience`, then append it to the session's
    /// trajectory. Never fails; see `LearnOutcome`.
    pub async fn update(
        &self,
        agent: &AgentType,
        experience: &Experience,
        rates: LearningRates,
    ) -> LearnOutcome {
        if let Err(e) = rates.validate() {
            return self.skipped(agent, &e);
        }

        let update = match self
            .q_table
            .apply_update(
                agent,
                &experience.state,
                &experience.action,
                experience.reward,
                &experience.next_state,
                &experience.next_actions,
                rates.alpha,
                rates.gamma,
            )
            .await
        {
            Ok(update) => update,
            Err(e) => return self.skipped(agent, &e),
        };

        self.publish(Event::ValueUpdated {
            agent_type: agent.to_string(),
            state_key: experience.state.to_string(),
            action: experience.action.clone(),
            value: update.new_value,
        });

        let trajectory = match self
            .trajectories
            .append(
                experience.session_id,
                &experience.state,
                &experience.action,
                experience.reward,
                &experience.next_state,
            )
            .await
        {
            Ok(index) => TrajectoryStatus::Recorded(index),
            Err(e) => {
                warn!(
                    agent_type = %agent,
                    session_id = %experience.session_id,
                    error = %e,
                    "value updated but trajectory append failed"
                );
                TrajectoryStatus::Failed(e.to_string())
            }
        };

        LearnOutcome::Learned(LearnedUpdate { update, trajectory })
    }

    /// Turn a task outcome into a reward and learn from it.
    ///
    /// The reward is also logged to the `rewards` table on a best-effort basis.
    #[allow(clippy::too_many_arguments)]
    pub async fn observe_outcome(
        &self,
        agent: &AgentType,
        session_id: SessionId,
        choice: &ActionChoice,
        outcome: &TaskOutcome,
        next_context: &Value,
        next_actions: &[Action],
        rates: LearningRates,
    ) -> Observation {
        let reward = self.rewards.breakdown(outcome, &choice.state);
        let next_state = self.encode(next_context);

        if let Err(e) = self
            .trajectories
            .record_reward(Some(session_id), agent, &choice.state, &choice.action, &reward)
            .await
        {
            warn!(agent_type = %agent, error = %e, "reward not recorded");
        }

        let experience = Experience {
            session_id,
            state: choice.state.clone(),
            action: choice.action.clone(),
            reward: reward.total,
            next_state: next_state.clone(),
            next_actions: next_actions.to_vec(),
        };
        let outcome = self.update(agent, &experience, rates).await;

        Observation {
            reward,
            next_state,
            outcome,
        }
    }

    fn skipped(&self, agent: &AgentType, err: &AqeError) -> LearnOutcome {
        let reason = SkipReason::from_error(err);
        warn!(agent_type = %agent, reason = %reason, "learning update skipped");
        self.publish(Event::LearningSkipped {
            agent_type: agent.to_string(),
            reason: reason.to_string(),
        });
        LearnOutcome::Skipped(reason)
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
