use futures::stream::{self, Stream, TryStreamExt};
use rusqlite::{OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use aqe_core::types::datetime_from_millis;
use aqe_core::{AgentType, AqeError, Event, EventBus, Result, SessionId, Transition, now_millis};
use aqe_memory::ConnectionManager;

use crate::reward::RewardBreakdown;
use crate::state::StateKey;

type RawTransition = (String, i64, String, String, f64, String, i64);

const TRANSITION_COLUMNS: &str =
    "session_id, seq_index, state_key, action, reward, next_state_key, created_at";

fn read_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTransition> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn to_transition(raw: RawTransition) -> Result<Transition> {
    let (id, seq_index, state_key, action, reward, next_state_key, created_at) = raw;
    let session_id = Uuid::parse_str(&id).map_err(|e| {
        AqeError::storage("trajectory.decode", format!("bad session id '{id}': {e}"))
    })?;
    Ok(Transition {
        session_id,
        seq_index: seq_index.max(0) as u64,
        state_key,
        action,
        reward,
        next_state_key,
        created_at: datetime_from_millis(created_at),
    })
}

/// Append-only log of a session's transitions.
///
/// Sequence indices are assigned by the store inside a write transaction, so
/// concurrent appends to one session produce `0..n` with no gaps.
#[derive(Clone)]
pub struct TrajectoryRecorder {
    db: ConnectionManager,
    events: Option<EventBus>,
}

impl TrajectoryRecorder {
    pub fn new(db: ConnectionManager) -> Self {
        Self { db, events: None }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Record one transition and return its sequence index.
    ///
    /// The session must exist and still be open.
    pub async fn append(
        &self,
        session_id: SessionId,
        state: &StateKey,
        action: &str,
        reward: f64,
        next_state: &StateKey,
    ) -> Result<u64> {
        if !reward.is_finite() {
            return Err(AqeError::validation("reward", format!("{reward} is not finite")));
        }
        let id = session_id.to_string();
        let (state, action, next_state) =
            (state.to_string(), action.to_string(), next_state.to_string());

        let seq_index = self
            .db
            .transaction("trajectory.append", move |tx| {
                let ended_at: Option<Option<i64>> = tx
                    .query_row(
                        "SELECT ended_at FROM sessions WHERE session_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match ended_at {
                    None => {
                        let reason = format!("session {id} does not exist");
                        return Err(AqeError::constraint("trajectory", reason).into());
                    }
                    Some(Some(_)) => {
                        let reason = format!("session {id} is closed");
                        return Err(AqeError::constraint("trajectory", reason).into());
                    }
                    Some(None) => {}
                }
                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq_index) + 1, 0)
                     FROM trajectories WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO trajectories
                       (session_id, seq_index, state_key, action, reward,
                        next_state_key, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, next, state, action, reward, next_state, now_millis()],
                )?;
                Ok(next.max(0) as u64)
            })
            .await?;

        debug!(session_id = %session_id, seq_index, "transition recorded");
        if let Some(bus) = &self.events {
            bus.publish(Event::TrajectoryAppended { session_id, seq_index });
        }
        Ok(seq_index)
    }

    /// The whole trajectory in sequence order.
    pub async fn replay(&self, session_id: SessionId) -> Result<Vec<Transition>> {
        self.page(session_id, None, None).await
    }

    /// Up to `limit` transitions with index greater than `after` (from the start when `None`).
    pub async fn replay_page(
        &self,
        session_id: SessionId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        self.page(session_id, after, Some(limit)).await
    }

    /// Lazily page through a long trajectory, `page_size` rows per query.
    pub fn replay_stream(
        &self,
        session_id: SessionId,
        page_size: usize,
    ) -> impl Stream<Item = Result<Transition>> + Send + 'static {
        let recorder = self.clone();
        let page_size = page_size.max(1);
        // state: Some(cursor) while more pages may exist
        stream::try_unfold(Some(None::<u64>), move |cursor| {
            let recorder = recorder.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok::<_, AqeError>(None);
                };
                let page = recorder.replay_page(session_id, after, page_size).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = (page.len() == page_size).then(|| page.last().map(|t| t.seq_index));
                Ok(Some((stream::iter(page.into_iter().map(Ok::<_, AqeError>)), next)))
            }
        })
        .try_flatten()
    }

    /// Number of recorded transitions.
    pub async fn len(&self, session_id: SessionId) -> Result<u64> {
        let id = session_id.to_string();
        let n: i64 = self
            .db
            .interact("trajectory.len", move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM trajectories WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Append a row to the `rewards` analytics table.
    pub async fn record_reward(
        &self,
        session_id: Option<SessionId>,
        agent: &AgentType,
        state: &StateKey,
        action: &str,
        breakdown: &RewardBreakdown,
    ) -> Result<()> {
        let session = session_id.map(|s| s.to_string());
        let (agent, state, action) = (agent.to_string(), state.to_string(), action.to_string());
        let total = breakdown.total;
        let components = serde_json::to_string(breakdown)?;
        self.db
            .interact("trajectory.record_reward", move |conn| {
                conn.execute(
                    "INSERT INTO rewards
                       (session_id, agent_type, state_key, action, reward, components, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![session, agent, state, action, total, components, now_millis()],
                )?;
                Ok(())
            })
            .await
    }

    async fn page(
        &self,
        session_id: SessionId,
        after: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Transition>> {
        let id = session_id.to_string();
        let after = after.map_or(-1, |a| a as i64);
        let limit = limit.map_or(-1, |l| l as i64);
        let raws = self
            .db
            .interact("trajectory.replay", move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {TRANSITION_COLUMNS} FROM trajectories
                     WHERE session_id = ?1 AND seq_index > ?2
                     ORDER BY seq_index LIMIT ?3"
                ))?;
                let raws = stmt
                    .query_map(params![id, after, limit], read_transition)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(raws)
            })
            .await?;
        raws.into_iter().map(to_transition).collect()
    }
}
