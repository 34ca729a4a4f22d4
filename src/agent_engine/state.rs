use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};
use crate::llm::types::ToolCall;

/// Lifecycle states of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Succeeded | AgentState::Failed | AgentState::Cancelled
        )
    }
}

/// Risk the model attached to its own request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredRisk {
    pub flag: bool,
    pub explanation: String,
}

/// Argument key the model uses to flag an action as sensitive.
const SAFETY_DECISION_KEY: &str = "safety_decision";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_risk: Option<DeclaredRisk>,
}

impl ActionRequest {
    /// Builds a request from a model tool call. A `safety_decision` argument is
    /// lifted out of `args` into `declared_risk`.
    pub fn from_tool_call(tc: &ToolCall) -> WebClawResult<Self> {
        let raw = tc.function.arguments.trim();
        let value: serde_json::Value = if raw.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| {
                WebClawError::ActionExecution(format!(
                    "malformed arguments for '{}': {e}",
                    tc.function.name
                ))
            })?
        };
        let serde_json::Value::Object(mut args) = value else {
            return Err(WebClawError::ActionExecution(format!(
                "arguments for '{}' must be a JSON object",
                tc.function.name
            )));
        };

        let declared_risk = args.remove(SAFETY_DECISION_KEY).map(|decision| {
            let flag = decision["decision"].as_str() == Some("require_confirmation")
                || decision["flag"].as_bool().unwrap_or(false);
            DeclaredRisk {
                flag,
                explanation: decision["explanation"].as_str().unwrap_or("").to_string(),
            }
        });

        Ok(Self {
            call_id: tc.id.clone(),
            name: tc.function.name.clone(),
            args,
            declared_risk,
        })
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub call_id: String,
    pub name: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ActionResult {
    pub fn success(
        action: &ActionRequest,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::build(action, ActionStatus::Success, payload, None)
    }

    pub fn error(action: &ActionRequest, error: impl Into<String>) -> Self {
        Self::build(action, ActionStatus::Error, Default::default(), Some(error.into()))
    }

    pub fn cancelled(action: &ActionRequest, reason: impl Into<String>) -> Self {
        Self::build(action, ActionStatus::Cancelled, Default::default(), Some(reason.into()))
    }

    fn build(
        action: &ActionRequest,
        status: ActionStatus,
        payload: serde_json::Map<String, serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        Self {
            call_id: action.call_id.clone(),
            name: action.name.clone(),
            status,
            payload,
            error,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Captured (title, URL, screenshot) browser state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub url: String,
    pub title: String,
    /// PNG bytes; kept out of the session record.
    #[serde(skip)]
    pub image_png: Vec<u8>,
    #[serde(default)]
    pub image_len: usize,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl Snapshot {
    pub fn new(url: String, title: String, image_png: Vec<u8>) -> Self {
        Self {
            url,
            title,
            image_len: image_png.len(),
            image_png,
            captured_at: chrono::Utc::now(),
        }
    }
}

/// How a task reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    FinalAnswer,
    AllActionsFailed,
    AllActionsDenied,
    MaxTurnsExceeded,
    DeadlineExceeded,
    StartUrlRejected,
    CallerCancelled,
    ModelClientFailure,
    ExecutorFailure,
}

/// One run of the agent. Mutated only by the turn controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub turn: u32,
    pub current_url: String,
    pub current_title: String,
    pub status: AgentState,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now(),
            turn: 0,
            current_url: String::new(),
            current_title: String::new(),
            status: AgentState::Initializing,
        }
    }

    pub fn observe(&mut self, snapshot: &Snapshot) {
        self.current_url = snapshot.url.clone();
        self.current_title = snapshot.title.clone();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs of the task entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instruction: String,
    #[serde(default)]
    pub start_url: Option<String>,
    pub max_turns: u32,
    pub safety_strict: bool,
}

impl TaskRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            start_url: None,
            max_turns: 20,
            safety_strict: true,
        }
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_safety_strict(mut self, strict: bool) -> Self {
        self.safety_strict = strict;
        self
    }
}

/// Final summary handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub session_id: String,
    pub success: bool,
    pub status: AgentState,
    pub termination: Termination,
    pub turns_completed: u32,
    pub final_url: String,
    pub final_title: String,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
