use rusqlite::{OptionalExtension, params};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use aqe_core::types::datetime_from_millis;
use aqe_core::{
    AgentType, AgentTypeRecord, AqeError, Event, EventBus, Result, Session, SessionId, now_millis,
};
use aqe_memory::ConnectionManager;

type RawSession = (String, String, i64, i64, Option<i64>);

fn read_agent_type(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

const SESSION_COLUMNS: &str = "session_id, agent_type, episode, started_at, ended_at";

fn read_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn to_session(raw: RawSession) -> Result<Session> {
    let (id, agent, episode, started_at, ended_at) = raw;
    let session_id = Uuid::parse_str(&id)
        .map_err(|e| AqeError::storage("session.decode", format!("bad session id '{id}': {e}")))?;
    Ok(Session {
        session_id,
        agent_type: AgentType::new(agent)?,
        episode: episode.max(0) as u64,
        started_at: datetime_from_millis(started_at),
        ended_at: ended_at.map(datetime_from_millis),
    })
}

/// Agent-type registry and episode lifecycle.
///
/// Sessions are the explicit context threaded through learning calls; there is
/// no ambient "current episode".
#[derive(Clone)]
pub struct SessionManager {
    db: ConnectionManager,
    events: Option<EventBus>,
}

impl SessionManager {
    pub fn new(db: ConnectionManager) -> Self {
        Self { db, events: None }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Register an agent kind. Re-registering returns the existing record unchanged.
    pub async fn register_agent_type(
        &self,
        agent: &AgentType,
        name: &str,
    ) -> Result<AgentTypeRecord> {
        let (id, name) = (agent.to_string(), name.to_string());
        let (type_id, name, created_at) = self
            .db
            .transaction("session.register_agent_type", move |tx| {
                tx.execute(
                    "INSERT INTO agent_types (type_id, name, created_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(type_id) DO NOTHING",
                    params![id, name, now_millis()],
                )?;
                Ok(tx.query_row(
                    "SELECT type_id, name, created_at FROM agent_types WHERE type_id = ?1",
                    params![id],
                    read_agent_type,
                )?)
            })
            .await?;
        Ok(AgentTypeRecord {
            type_id: AgentType::new(type_id)?,
            name,
            created_at: datetime_from_millis(created_at),
        })
    }

    pub async fn agent_types(&self) -> Result<Vec<AgentTypeRecord>> {
        let rows = self
            .db
            .interact("session.agent_types", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT type_id, name, created_at FROM agent_types ORDER BY type_id",
                )?;
                let rows = stmt
                    .query_map([], read_agent_type)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(id, name, created_at)| {
                Ok(AgentTypeRecord {
                    type_id: AgentType::new(id)?,
                    name,
                    created_at: datetime_from_millis(created_at),
                })
            })
            .collect()
    }

    /// Start a new episode. Unregistered agent types are registered on the fly.
    pub async fn open_session(&self, agent: &AgentType) -> Result<Session> {
        let id = Uuid::new_v4();
        let agent_name = agent.to_string();
        let session_text = id.to_string();
        let raw = self
            .db
            .transaction("session.open", move |tx| {
                let now = now_millis();
                tx.execute(
                    "INSERT INTO agent_types (type_id, name, created_at) VALUES (?1, ?1, ?2)
                     ON CONFLICT(type_id) DO NOTHING",
                    params![agent_name, now],
                )?;
                let episode: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(episode), 0) + 1 FROM sessions WHERE agent_type = ?1",
                    params![agent_name],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO sessions (session_id, agent_type, episode, started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, NULL)",
                    params![session_text, agent_name, episode, now],
                )?;
                Ok((session_text.clone(), agent_name.clone(), episode, now, None))
            })
            .await?;
        let session = to_session(raw)?;

        info!(
            session_id = %session.session_id,
            agent_type = %agent,
            episode = session.episode,
            "session opened"
        );
        self.publish(Event::SessionOpened {
            session_id: session.session_id,
            agent_type: agent.to_string(),
            episode: session.episode,
        });
        Ok(session)
    }

    /// End an episode. Closing twice is a `ConstraintViolation`.
    pub async fn close_session(&self, session_id: SessionId) -> Result<Session> {
        let id = session_id.to_string();
        let raw = self
            .db
            .transaction("session.close", move |tx| {
                let raw = tx
                    .query_row(
                        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                        params![id],
                        read_session,
                    )
                    .optional()?;
                let Some(mut raw) = raw else {
                    return Err(AqeError::NotFound {
                        entity: "session".into(),
                        id: id.clone(),
                    }
                    .into());
                };
                if raw.4.is_some() {
                    let reason = format!("session {id} is already closed");
                    return Err(AqeError::constraint("session", reason).into());
                }
                let now = now_millis();
                tx.execute(
                    "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2",
                    params![now, id],
                )?;
                raw.4 = Some(now);
                Ok(raw)
            })
            .await?;
        let session = to_session(raw)?;

        info!(session_id = %session_id, agent_type = %session.agent_type, "session closed");
        self.publish(Event::SessionClosed {
            session_id,
            agent_type: session.agent_type.to_string(),
        });
        Ok(session)
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let id = session_id.to_string();
        let raw = self
            .db
            .interact("session.get", move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                        params![id],
                        read_session,
                    )
                    .optional()?)
            })
            .await?;
        raw.map(to_session).transpose()
    }

    /// Every session of an agent type, oldest episode first.
    pub async fn sessions_for_agent(&self, agent: &AgentType) -> Result<Vec<Session>> {
        let name = agent.to_string();
        let raws = self
            .db
            .interact("session.list", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE agent_type = ?1 ORDER BY episode"
                ))?;
                let raws = stmt
                    .query_map(params![name], read_session)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(raws)
            })
            .await?;
        raws.into_iter()
            .map(to_session)
            .collect()
    }

    /// Persist an agent type's opaque state blob (e.g. its epsilon schedule position).
    pub async fn save_agent_state(&self, agent: &AgentType, state: &Value) -> Result<()> {
        let (name, text) = (agent.to_string(), serde_json::to_string(state)?);
        self.db
            .interact("session.save_agent_state", move |conn| {
                conn.execute(
                    "INSERT INTO agent_states (agent_type, state, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(agent_type) DO UPDATE SET
                       state = excluded.state,
                       updated_at = excluded.updated_at",
                    params![name, text, now_millis()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_agent_state(&self, agent: &AgentType) -> Result<Option<Value>> {
        let name = agent.to_string();
        let text: Option<String> = self
            .db
            .interact("session.load_agent_state", move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT state FROM agent_states WHERE agent_type = ?1",
                        params![name],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
