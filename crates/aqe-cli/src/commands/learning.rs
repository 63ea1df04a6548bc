use console::style;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;

use aqe_config::AqeConfig;
use aqe_core::{AgentType, AqeError, Result, Session};
use aqe_learning::{
    EpsilonSchedule, Experience, LearnOutcome, LearningRates, QLearner, RewardCalculator,
    SessionManager, StateEncoder, TaskOutcome, TrajectoryRecorder,
};

use super::{
    QTableAction, SessionAction, TrajectoryAction, connect, parse_json, parse_session_id,
    print_json,
};

fn print_session(s: &Session) {
    let state = match s.ended_at {
        Some(at) => format!("closed {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => style("open").green().to_string(),
    };
    println!(
        "{}  {}  episode {}  started {}  {}",
        style(s.session_id).cyan(),
        s.agent_type,
        s.episode,
        s.started_at.format("%Y-%m-%d %H:%M:%S"),
        state
    );
}

pub(super) async fn cmd_session(config: &AqeConfig, action: SessionAction) -> Result<()> {
    let sessions = SessionManager::new(connect(config).await?);

    match action {
        SessionAction::Register { agent, name } => {
            let agent = AgentType::new(agent)?;
            let name = name.unwrap_or_else(|| agent.to_string());
            let record = sessions.register_agent_type(&agent, &name).await?;
            println!("{} {} ({})", style("✓").green(), record.type_id, record.name);
        }
        SessionAction::Agents => {
            let agents = sessions.agent_types().await?;
            if agents.is_empty() {
                println!("No agent types registered.");
            }
            for a in agents {
                println!(
                    "{}  {}  since {}",
                    style(&a.type_id).cyan(),
                    a.name,
                    a.created_at.format("%Y-%m-%d")
                );
            }
        }
        SessionAction::Open { agent } => {
            let session = sessions.open_session(&AgentType::new(agent)?).await?;
            print_session(&session);
        }
        SessionAction::Close { id } => {
            let session = sessions.close_session(parse_session_id(&id)?).await?;
            print_session(&session);
        }
        SessionAction::Show { id } => match sessions.get_session(parse_session_id(&id)?).await? {
            Some(session) => print_json(&session)?,
            None => return Err(AqeError::NotFound { entity: "session".into(), id }),
        },
        SessionAction::List { agent } => {
            let list = sessions.sessions_for_agent(&AgentType::new(agent)?).await?;
            if list.is_empty() {
                println!("No sessions.");
            }
            for s in &list {
                print_session(s);
            }
        }
    }
    Ok(())
}

pub(super) async fn cmd_qtable(config: &AqeConfig, action: QTableAction) -> Result<()> {
    let learner = QLearner::new(connect(config).await?, &config.learning);
    let table = learner.q_table();

    match action {
        QTableAction::Show { agent, json } => {
            let entries = table.entries(&AgentType::new(agent)?).await?;
            if json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("No learned values.");
            }
            let mut current: Option<&str> = None;
            for q in &entries {
                if current != Some(q.state_key.as_str()) {
                    println!("{}", style(&q.state_key).bold());
                    current = Some(q.state_key.as_str());
                }
                println!("  {:<24} {:>10.4}  ({} visits)", q.action, q.value, q.visits);
            }
        }
        QTableAction::Reset { agent, yes } => {
            if !yes {
                return Err(AqeError::validation(
                    "yes",
                    "resetting drops every learned value; pass --yes to confirm",
                ));
            }
            let removed = table.reset(&AgentType::new(agent)?).await?;
            println!("{} removed {removed} values", style("✓").green());
        }
        QTableAction::Patterns { agent, min_visits } => {
            let agent = AgentType::new(agent)?;
            table.refresh_patterns(&agent, min_visits).await?;
            let patterns = table.patterns(&agent).await?;
            if patterns.is_empty() {
                println!("No patterns with at least {min_visits} visits.");
            }
            for p in patterns {
                println!(
                    "{}\n  → {} (value {:.4}, confidence {:.0}%, support {})",
                    style(&p.state_key).bold(),
                    style(&p.action).green(),
                    p.value,
                    p.confidence * 100.0,
                    p.support
                );
            }
        }
    }
    Ok(())
}

pub(super) async fn cmd_trajectory(config: &AqeConfig, action: TrajectoryAction) -> Result<()> {
    let recorder = TrajectoryRecorder::new(connect(config).await?);

    match action {
        TrajectoryAction::Replay { id, page_size, json } => {
            let session_id = parse_session_id(&id)?;
            let mut stream = recorder.replay_stream(session_id, page_size).boxed();
            let mut count = 0u64;
            while let Some(t) = stream.try_next().await? {
                if json {
                    println!("{}", serde_json::to_string(&t)?);
                } else {
                    println!(
                        "{:>5}  {}  --{}-->  {}  reward {:+.3}",
                        t.seq_index,
                        style(&t.state_key).dim(),
                        style(&t.action).cyan(),
                        style(&t.next_state_key).dim(),
                        t.reward
                    );
                }
                count += 1;
            }
            if !json {
                println!("{count} transitions");
            }
        }
    }
    Ok(())
}

pub(super) async fn cmd_decide(
    config: &AqeConfig,
    agent: &str,
    context: &str,
    actions: &[String],
    epsilon: Option<f64>,
    episode: u64,
) -> Result<()> {
    let agent = AgentType::new(agent)?;
    let context = parse_json("context", context)?;
    let epsilon = epsilon.unwrap_or_else(|| {
        EpsilonSchedule::from_config(&config.learning.epsilon).for_episode(episode)
    });

    let learner = QLearner::new(connect(config).await?, &config.learning);
    let choice = learner.choose_action(&agent, &context, actions, epsilon).await?;
    let fingerprint = choice.state.fingerprint();
    print_json(&serde_json::json!({
        "action": choice.action,
        "policy": choice.policy,
        "value": choice.value,
        "epsilon": epsilon,
        "state": choice.state,
        "fingerprint": fingerprint,
    }))
}

/// Arguments of `aqe learn`.
pub(super) struct LearnRequest {
    pub agent: String,
    pub session: String,
    pub context: String,
    pub action: String,
    pub outcome: String,
    pub next_context: Option<String>,
    pub next_actions: Vec<String>,
}

pub(super) async fn cmd_learn(config: &AqeConfig, req: LearnRequest) -> Result<()> {
    let agent = AgentType::new(req.agent)?;
    let session_id = parse_session_id(&req.session)?;
    let context = parse_json("context", &req.context)?;
    let next_context = match req.next_context.as_deref() {
        Some(raw) => parse_json("next_context", raw)?,
        None => context.clone(),
    };
    let outcome = TaskOutcome::from_value(&parse_json("outcome", &req.outcome)?);

    let learner = QLearner::new(connect(config).await?, &config.learning);
    let state = learner.encode(&context);
    let reward = learner.rewards().breakdown(&outcome, &state);
    let experience = Experience {
        session_id,
        state,
        action: req.action,
        reward: reward.total,
        next_state: learner.encode(&next_context),
        next_actions: req.next_actions,
    };

    match learner
        .update(&agent, &experience, LearningRates::from_config(&config.learning))
        .await
    {
        LearnOutcome::Learned(learned) => {
            println!(
                "{} {} = {:.4} (reward {:+.3}, {} visits)",
                style("✓").green(),
                experience.action,
                learned.update.new_value,
                reward.total,
                learned.update.visits
            );
            if let Some(w) = learned.warning() {
                println!("{} trajectory not recorded: {w}", style("!").yellow());
            }
            Ok(())
        }
        LearnOutcome::Skipped(reason) => Err(AqeError::storage("learn", reason)),
    }
}

pub(super) fn cmd_reward(config: &AqeConfig, outcome: &str, context: Option<&str>) -> Result<()> {
    let outcome = TaskOutcome::from_value(&parse_json("outcome", outcome)?);
    let context = match context {
        Some(raw) => parse_json("context", raw)?,
        None => Value::Object(Default::default()),
    };
    let state = StateEncoder::default().encode(&context);
    let breakdown =
        RewardCalculator::new(config.learning.reward.clone()).breakdown(&outcome, &state);
    print_json(&breakdown)
}
