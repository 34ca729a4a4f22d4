use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{WebClawError, WebClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::types::{CallConfig, ChatMessage, FunctionCall, LlmResponse, ToolCall, ToolDef};

/// Replays canned replies in order and records what it was sent.
/// Used for dry runs and to drive the agent loop deterministically in tests.
pub struct ScriptedProvider {
    id: String,
    replies: Mutex<VecDeque<WebClawResult<LlmResponse>>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<LlmResponse>) -> Self {
        Self {
            id: "scripted".into(),
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            seen: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure to be returned on its turn.
    pub fn push_error(&self, err: WebClawError) {
        self.lock_replies().push_back(Err(err));
    }

    pub fn push_reply(&self, reply: LlmResponse) {
        self.lock_replies().push_back(Ok(reply));
    }

    /// Message lists received so far, one per call.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Tool names declared on each call.
    pub fn declared_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<WebClawResult<LlmResponse>>> {
        self.replies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Convenience builder for a reply that requests one or more actions.
pub fn action_reply(calls: &[(&str, serde_json::Value)]) -> LlmResponse {
    LlmResponse {
        content: String::new(),
        reasoning: String::new(),
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{i}_{name}"),
                call_type: "function".into(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            })
            .collect(),
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDef>,
        _cfg: &CallConfig,
    ) -> WebClawResult<LlmResponse> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages);
        }
        if let Ok(mut seen_tools) = self.seen_tools.lock() {
            seen_tools.push(tools.into_iter().map(|t| t.function.name).collect());
        }
        self.lock_replies().pop_front().unwrap_or_else(|| {
            Err(WebClawError::LlmProvider("scripted replies exhausted".into()))
        })
    }
}
