use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the learning and shared-memory components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Session lifecycle ──────────────────────────────────────
    SessionOpened {
        session_id: Uuid,
        agent_type: String,
        episode: u64,
    },
    SessionClosed {
        session_id: Uuid,
        agent_type: String,
    },

    // ── Decision cycle ─────────────────────────────────────────
    ActionChosen {
        agent_type: String,
        state_key: String,
        action: String,
        policy: String,
    },
    ValueUpdated {
        agent_type: String,
        state_key: String,
        action: String,
        value: f64,
    },
    LearningSkipped {
        agent_type: String,
        reason: String,
    },
    TrajectoryAppended {
        session_id: Uuid,
        seq_index: u64,
    },

    // ── Shared memory ──────────────────────────────────────────
    MemoryStored {
        key: String,
    },
    MemoryDeleted {
        key: String,
    },
    MemoryReaped {
        count: usize,
    },
}

/// A broadcast-based event bus for subsystem-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
