use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use aqe_core::types::datetime_from_millis;
use aqe_core::{AgentType, AqeError, QValue, Result, now_millis};
use aqe_memory::{ConnectionManager, DbError};

use crate::state::StateKey;

/// Result of one atomic temporal-difference update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QUpdate {
    /// Stored value before the update; `None` on first visit.
    pub old_value: Option<f64>,
    /// Best stored value among the next-state candidates (0 when none exist).
    pub max_next: f64,
    /// `reward + gamma * max_next`.
    pub target: f64,
    pub new_value: f64,
    pub visits: u64,
}

/// Best known action for a state, derived from the Q-table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub agent_type: String,
    pub state_key: String,
    pub action: String,
    pub value: f64,
    /// Share of the state's visits that went to `action`.
    pub confidence: f64,
    /// Total visits across the state's actions.
    pub support: u64,
}

/// Q-values keyed by `(agent type, state key, action)` in the shared store.
#[derive(Clone)]
pub struct QTableStore {
    db: ConnectionManager,
}

type RawQValue = (String, String, String, f64, i64, i64);

fn read_q_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQValue> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn to_q_value(raw: RawQValue) -> std::result::Result<QValue, DbError> {
    let (agent, state_key, action, value, visits, updated_at) = raw;
    Ok(QValue {
        agent_type: AgentType::new(agent)?,
        state_key,
        action,
        value,
        visits: visits.max(0) as u64,
        updated_at: datetime_from_millis(updated_at),
    })
}

/// Stored values for `state`, returned in `candidates` order; unvisited candidates are skipped.
fn candidate_values(
    tx: &rusqlite::Connection,
    agent: &str,
    state: &str,
    candidates: &[String],
) -> rusqlite::Result<Vec<(String, f64)>> {
    let mut stmt = tx.prepare_cached(
        "SELECT action, value FROM q_values WHERE agent_type = ?1 AND state_key = ?2",
    )?;
    let stored = stmt
        .query_map(params![agent, state], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<std::collections::HashMap<_, _>>>()?;
    Ok(candidates
        .iter()
        .filter_map(|a| stored.get(a).map(|v| (a.clone(), *v)))
        .collect())
}

/// First candidate holding the maximum value; later ties lose.
fn pick_best(values: Vec<(String, f64)>) -> Option<(String, f64)> {
    values.into_iter().fold(None, |best, (action, value)| match best {
        Some((_, best_value)) if best_value >= value => best,
        _ => Some((action, value)),
    })
}

fn upsert_value(
    tx: &Transaction<'_>,
    agent: &str,
    state: &str,
    action: &str,
    value: f64,
    now: i64,
) -> rusqlite::Result<u64> {
    let visits: i64 = tx.query_row(
        "INSERT INTO q_values (agent_type, state_key, action, value, visits, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(agent_type, state_key, action) DO UPDATE SET
            value = excluded.value,
            visits = q_values.visits + 1,
            updated_at = excluded.updated_at
         RETURNING visits",
        params![agent, state, action, value, now],
        |row| row.get(0),
    )?;
    Ok(visits.max(0) as u64)
}

impl QTableStore {
    pub fn new(db: ConnectionManager) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &ConnectionManager {
        &self.db
    }

    pub async fn get(
        &self,
        agent: &AgentType,
        state: &StateKey,
        action: &str,
    ) -> Result<Option<QValue>> {
        let (agent, state, action) = (agent.to_string(), state.to_string(), action.to_string());
        self.db
            .interact("q_table.get", move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT agent_type, state_key, action, value, visits, updated_at
                         FROM q_values WHERE agent_type = ?1 AND state_key = ?2 AND action = ?3",
                        params![agent, state, action],
                        read_q_value,
                    )
                    .optional()?;
                raw.map(to_q_value).transpose()
            })
            .await
    }

    /// Highest-valued candidate with a stored value. Ties go to the earliest
    /// candidate; `None` when no candidate has been visited in this state.
    pub async fn best_action(
        &self,
        agent: &AgentType,
        state: &StateKey,
        candidates: &[String],
    ) -> Result<Option<(String, f64)>> {
        let (agent, state, candidates) =
            (agent.to_string(), state.to_string(), candidates.to_vec());
        self.db
            .interact("q_table.best_action", move |conn| {
                Ok(pick_best(candidate_values(conn, &agent, &state, &candidates)?))
            })
            .await
    }

    /// Best stored value among `candidates`, if any has one.
    pub async fn max_value(
        &self,
        agent: &AgentType,
        state: &StateKey,
        candidates: &[String],
    ) -> Result<Option<f64>> {
        Ok(self.best_action(agent, state, candidates).await?.map(|(_, v)| v))
    }

    /// Blind insert-or-overwrite of one value. Last writer wins.
    pub async fn upsert(
        &self,
        agent: &AgentType,
        state: &StateKey,
        action: &str,
        value: f64,
    ) -> Result<u64> {
        if !value.is_finite() {
            return Err(AqeError::validation("value", format!("{value} is not finite")));
        }
        let (agent, state, action) = (agent.to_string(), state.to_string(), action.to_string());
        self.db
            .transaction("q_table.upsert", move |tx| {
                Ok(upsert_value(tx, &agent, &state, &action, value, now_millis())?)
            })
            .await
    }

    /// `Q(s,a) ← Q(s,a) + α·(r + γ·max_a' Q(s',a') − Q(s,a))`, evaluated against
    /// the stored values under the database write lock.
    ///
    /// Concurrent updates of the same triple serialize; each sees the result
    /// of the previous one, so no update is lost.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_update(
        &self,
        agent: &AgentType,
        state: &StateKey,
        action: &str,
        reward: f64,
        next_state: &StateKey,
        next_actions: &[String],
        alpha: f64,
        gamma: f64,
    ) -> Result<QUpdate> {
        if !reward.is_finite() {
            return Err(AqeError::validation("reward", format!("{reward} is not finite")));
        }
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(AqeError::validation("alpha", format!("{alpha} is outside (0, 1]")));
        }
        if !(0.0..=1.0).contains(&gamma) {
            return Err(AqeError::validation("gamma", format!("{gamma} is outside [0, 1]")));
        }

        let agent_name = agent.to_string();
        let (state_key, action_name) = (state.to_string(), action.to_string());
        let (next_key, next_actions) = (next_state.to_string(), next_actions.to_vec());

        let update = self
            .db
            .transaction("q_table.apply_update", move |tx| {
                let old_value: Option<f64> = tx
                    .query_row(
                        "SELECT value FROM q_values
                         WHERE agent_type = ?1 AND state_key = ?2 AND action = ?3",
                        params![agent_name, state_key, action_name],
                        |row| row.get(0),
                    )
                    .optional()?;
                let max_next =
                    pick_best(candidate_values(tx, &agent_name, &next_key, &next_actions)?)
                        .map_or(0.0, |(_, v)| v);

                let target = reward + gamma * max_next;
                let current = old_value.unwrap_or(0.0);
                let new_value = current + alpha * (target - current);
                let visits = upsert_value(
                    tx,
                    &agent_name,
                    &state_key,
                    &action_name,
                    new_value,
                    now_millis(),
                )?;

                Ok(QUpdate {
                    old_value,
                    max_next,
                    target,
                    new_value,
                    visits,
                })
            })
            .await?;

        debug!(
            agent_type = %agent,
            state = %state.fingerprint(),
            action,
            value = update.new_value,
            visits = update.visits,
            "q-value updated"
        );
        Ok(update)
    }

    /// Every stored value for an agent type, ordered by state then action.
    pub async fn entries(&self, agent: &AgentType) -> Result<Vec<QValue>> {
        let agent = agent.to_string();
        self.db
            .interact("q_table.entries", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_type, state_key, action, value, visits, updated_at
                     FROM q_values WHERE agent_type = ?1 ORDER BY state_key, action",
                )?;
                let raws = stmt
                    .query_map(params![agent], read_q_value)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                raws.into_iter().map(to_q_value).collect()
            })
            .await
    }

    /// Drop an agent type's learned values and derived patterns.
    pub async fn reset(&self, agent: &AgentType) -> Result<u64> {
        let name = agent.to_string();
        let removed = self
            .db
            .transaction("q_table.reset", move |tx| {
                tx.execute("DELETE FROM patterns WHERE agent_type = ?1", params![name])?;
                Ok(tx.execute("DELETE FROM q_values WHERE agent_type = ?1", params![name])?)
            })
            .await?;
        info!(agent_type = %agent, removed, "q-table reset");
        Ok(removed as u64)
    }

    /// Rebuild the `patterns` table for an agent type from its Q-values.
    ///
    /// Only actions visited at least `min_visits` times are considered.
    /// Returns the number of patterns written.
    pub async fn refresh_patterns(&self, agent: &AgentType, min_visits: u64) -> Result<u64> {
        let name = agent.to_string();
        self.db
            .transaction("q_table.refresh_patterns", move |tx| {
                let rows = {
                    let mut stmt = tx.prepare(
                        "SELECT state_key, action, value, visits FROM q_values
                         WHERE agent_type = ?1 ORDER BY state_key, rowid",
                    )?;
                    let rows = stmt
                        .query_map(params![name], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, f64>(2)?,
                                row.get::<_, i64>(3)?.max(0) as u64,
                            ))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                tx.execute("DELETE FROM patterns WHERE agent_type = ?1", params![name])?;

                let now = now_millis();
                let mut written = 0u64;
                let mut i = 0;
                while i < rows.len() {
                    let state = &rows[i].0;
                    let end = rows[i..]
                        .iter()
                        .position(|r| &r.0 != state)
                        .map_or(rows.len(), |n| i + n);
                    let group = &rows[i..end];
                    let support: u64 = group.iter().map(|r| r.3).sum();
                    let best = group
                        .iter()
                        .filter(|r| r.3 >= min_visits)
                        .fold(None::<&(String, String, f64, u64)>, |best, r| match best {
                            Some(b) if b.2 >= r.2 => Some(b),
                            _ => Some(r),
                        });
                    if let Some((state, action, _, visits)) = best {
                        let confidence = if support == 0 {
                            0.0
                        } else {
                            *visits as f64 / support as f64
                        };
                        tx.execute(
                            "INSERT INTO patterns
                               (agent_type, state_key, action, confidence, support, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![name, state, action, confidence, support as i64, now],
                        )?;
                        written += 1;
                    }
                    i = end;
                }
                Ok(written)
            })
            .await
    }

    /// Derived patterns for an agent type, ordered by state.
    pub async fn patterns(&self, agent: &AgentType) -> Result<Vec<Pattern>> {
        let name = agent.to_string();
        self.db
            .interact("q_table.patterns", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT p.agent_type, p.state_key, p.action, COALESCE(q.value, 0.0),
                            p.confidence, p.support
                     FROM patterns p
                     LEFT JOIN q_values q
                       ON q.agent_type = p.agent_type
                      AND q.state_key = p.state_key
                      AND q.action = p.action
                     WHERE p.agent_type = ?1 ORDER BY p.state_key",
                )?;
                let patterns = stmt
                    .query_map(params![name], |row| {
                        Ok(Pattern {
                            agent_type: row.get(0)?,
                            state_key: row.get(1)?,
                            action: row.get(2)?,
                            value: row.get(3)?,
                            confidence: row.get(4)?,
                            support: row.get::<_, i64>(5)?.max(0) as u64,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(patterns)
            })
            .await
    }
}
