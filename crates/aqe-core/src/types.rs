use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AqeError, Result};

/// Unique identifier for a learning session (one episode/run of an agent).
pub type SessionId = Uuid;

/// An action an agent may take. Actions are opaque labels chosen by the agent.
pub type Action = String;

/// Maximum length of an agent type identifier.
pub const MAX_AGENT_TYPE_LEN: usize = 64;

/// Identifier of a registered agent kind, e.g. `test-generator`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentType(String);

impl AgentType {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(AqeError::validation("agent_type", "must not be empty"));
        }
        if id.len() > MAX_AGENT_TYPE_LEN {
            return Err(AqeError::validation(
                "agent_type",
                format!("'{id}' exceeds {MAX_AGENT_TYPE_LEN} characters"),
            ));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(AqeError::validation(
                "agent_type",
                format!("'{id}' contains invalid character {c:?}"),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentType {
    type Err = AqeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for AgentType {
    type Error = AqeError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AgentType> for String {
    fn from(value: AgentType) -> Self {
        value.0
    }
}

/// A registered agent kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeRecord {
    pub type_id: AgentType,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One learning episode of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub agent_type: AgentType,
    /// 1-based episode number among all sessions of this agent type.
    pub episode: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Learned value of taking `action` in `state_key` for an agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QValue {
    pub agent_type: AgentType,
    pub state_key: String,
    pub action: Action,
    pub value: f64,
    /// Number of writes applied to this triple.
    pub visits: u64,
    pub updated_at: DateTime<Utc>,
}

/// One observed (state, action, reward, next-state) transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub session_id: SessionId,
    pub seq_index: u64,
    pub state_key: String,
    pub action: Action,
    pub reward: f64,
    pub next_state_key: String,
    pub created_at: DateTime<Utc>,
}

/// Current wall-clock time as Unix milliseconds, the storage representation
/// of every timestamp in the relational schema.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored Unix milliseconds back into a UTC timestamp.
pub fn datetime_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
