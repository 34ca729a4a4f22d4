use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent_engine::state::{ActionStatus, AgentOutcome};

/// Progress notifications for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    TaskStarted {
        session_id: String,
        instruction: String,
    },
    TurnStarted {
        turn: u32,
    },
    ActionRequested {
        turn: u32,
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ConfirmationRequired {
        call_id: String,
        name: String,
        reason: String,
    },
    ActionCompleted {
        call_id: String,
        name: String,
        status: ActionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TurnCompleted {
        turn: u32,
        url: String,
        title: String,
    },
    TaskFinished {
        outcome: AgentOutcome,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. No subscribers is fine.
    pub fn emit(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
