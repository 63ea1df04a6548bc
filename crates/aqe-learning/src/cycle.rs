use std::fmt;

use serde_json::Value;
use tracing::debug;

use aqe_core::{Action, AgentType, AqeError, Result, SessionId};

use crate::learner::{ActionChoice, LearningRates, Observation, QLearner};
use crate::reward::TaskOutcome;

/// Phase of a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    AwaitingAction,
    ActionChosen,
    AwaitingOutcome,
    ValueUpdated,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CyclePhase::AwaitingAction => "AWAITING_ACTION",
            CyclePhase::ActionChosen => "ACTION_CHOSEN",
            CyclePhase::AwaitingOutcome => "AWAITING_OUTCOME",
            CyclePhase::ValueUpdated => "VALUE_UPDATED",
        })
    }
}

/// Drives one agent decision through
/// `AWAITING_ACTION → ACTION_CHOSEN → AWAITING_OUTCOME → VALUE_UPDATED`.
///
/// Calling a step out of order is a `ConstraintViolation` and leaves the
/// cycle where it was.
pub struct DecisionCycle {
    learner: QLearner,
    agent: AgentType,
    session_id: SessionId,
    phase: CyclePhase,
    choice: Option<ActionChoice>,
}

impl DecisionCycle {
    pub fn new(learner: QLearner, agent: AgentType, session_id: SessionId) -> Self {
        Self {
            learner,
            agent,
            session_id,
            phase: CyclePhase::AwaitingAction,
            choice: None,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn choice(&self) -> Option<&ActionChoice> {
        self.choice.as_ref()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn require(&self, phase: CyclePhase, step: &str) -> Result<()> {
        if self.phase != phase {
            return Err(AqeError::constraint(
                "decision_cycle",
                format!("{step} requires {phase}, cycle is {}", self.phase),
            ));
        }
        Ok(())
    }

    fn advance(&mut self, to: CyclePhase) {
        debug!(agent_type = %self.agent, from = %self.phase, to = %to, "decision cycle advanced");
        self.phase = to;
    }

    /// `AWAITING_ACTION → ACTION_CHOSEN`
    pub async fn choose(
        &mut self,
        context: &Value,
        candidates: &[Action],
        epsilon: f64,
    ) -> Result<ActionChoice> {
        self.require(CyclePhase::AwaitingAction, "choose")?;
        let choice = self
            .learner
            .choose_action(&self.agent, context, candidates, epsilon)
            .await?;
        self.choice = Some(choice.clone());
        self.advance(CyclePhase::ActionChosen);
        Ok(choice)
    }

    /// `ACTION_CHOSEN → AWAITING_OUTCOME`, marking the action as being executed.
    pub fn begin_execution(&mut self) -> Result<()> {
        self.require(CyclePhase::ActionChosen, "begin_execution")?;
        self.advance(CyclePhase::AwaitingOutcome);
        Ok(())
    }

    /// `AWAITING_OUTCOME → VALUE_UPDATED`. The transition happens even when the
    /// update itself was skipped; the observation says which.
    pub async fn complete(
        &mut self,
        outcome: &TaskOutcome,
        next_context: &Value,
        next_actions: &[Action],
        rates: LearningRates,
    ) -> Result<Observation> {
        self.require(CyclePhase::AwaitingOutcome, "complete")?;
        let Some(choice) = self.choice.as_ref() else {
            return Err(AqeError::constraint("decision_cycle", "no action was chosen"));
        };
        let observation = self
            .learner
            .observe_outcome(
                &self.agent,
                self.session_id,
                choice,
                outcome,
                next_context,
                next_actions,
                rates,
            )
            .await;
        self.advance(CyclePhase::ValueUpdated);
        Ok(observation)
    }

    /// `VALUE_UPDATED → AWAITING_ACTION`, ready for the next decision.
    pub fn reset(&mut self) -> Result<()> {
        self.require(CyclePhase::ValueUpdated, "reset")?;
        self.choice = None;
        self.advance(CyclePhase::AwaitingAction);
        Ok(())
    }
}
