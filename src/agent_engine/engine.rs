use std::sync::Arc;

use serde_json::Map;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::event_bus::{AgentEvent, EventBus};
use crate::agent_engine::history::{
    Conversation, ConversationEntry, SessionRecord, SessionStore, TurnSummary,
};
use crate::agent_engine::loop_control::{LoopConfig, LoopController, TurnVerdict};
use crate::agent_engine::state::{
    ActionRequest, ActionResult, AgentOutcome, AgentState, Session, TaskRequest, Termination,
};
use crate::config::{AgentSettings, AppConfig, DenialPolicy};
use crate::errors::WebClawError;
use crate::executor::confirm::ConfirmationGate;
use crate::executor::dispatcher::ActionDispatcher;
use crate::executor::domain::DomainGate;
use crate::executor::safety::SafetyClassifier;
use crate::llm::provider::LlmProvider;
use crate::llm::tools::browser_tools;
use crate::llm::types::{CallConfig, ToolCall};

const SYSTEM_PROMPT: &str = "\
You are WebClaw, a browser automation agent controlling a single Chrome tab.

Rules:
- Each turn you receive the current URL, page title and a screenshot of the viewport.
- Act only through the provided tools. Coordinates are normalized: 0-999 on each axis,
  (0,0) top-left, regardless of the real screen size.
- Prefer one or two actions per turn and check the next screenshot before continuing.
- If an action may be irreversible or touches sensitive data, add a `safety_decision`
  argument: {\"decision\": \"require_confirmation\", \"explanation\": \"...\"}.
- When the task is complete, reply with a short plain-text answer and no tool calls.
- If the task cannot be completed, say so plainly and stop calling tools.";

/// Drives one task at a time: model → safety → domain → executor → observation.
pub struct TurnController {
    provider: Arc<dyn LlmProvider>,
    call_config: CallConfig,
    dispatcher: ActionDispatcher,
    gate: Box<dyn ConfirmationGate>,
    classifier: SafetyClassifier,
    domain_gate: DomainGate,
    strict_excluded: Vec<String>,
    agent: AgentSettings,
    events: Option<EventBus>,
    store: Option<SessionStore>,
    cancel: CancellationToken,
    session: Session,
    record: SessionRecord,
}

impl TurnController {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        call_config: CallConfig,
        dispatcher: ActionDispatcher,
        gate: Box<dyn ConfirmationGate>,
        config: &AppConfig,
    ) -> Self {
        let session = Session::new();
        let record = SessionRecord::new(&session, "");
        Self {
            provider,
            call_config,
            dispatcher,
            gate,
            classifier: SafetyClassifier::new(&config.safety),
            domain_gate: DomainGate::new(config.safety.allowed_domains.clone()),
            strict_excluded: config.safety.strict_excluded_actions.clone(),
            agent: config.agent.clone(),
            events: None,
            store: None,
            cancel: CancellationToken::new(),
            session,
            record,
        }
    }

    /// Resolves the `tools` role against the registry.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn conversation(&self) -> &Conversation {
        &self.record.conversation
    }

    /// Closes the browser. The controller cannot run further tasks afterwards.
    pub async fn shutdown(&mut self) {
        self.dispatcher.shutdown().await;
    }

    /// Runs `task` to a terminal state. Never returns an error: every failure
    /// is folded into the outcome.
    pub async fn run(&mut self, task: TaskRequest) -> AgentOutcome {
        self.session = Session::new();
        self.record = SessionRecord::new(&self.session, &task.instruction);

        tracing::info!(
            session = %self.session.id,
            strict = task.safety_strict,
            max_turns = task.max_turns,
            instruction = %task.instruction,
            "task started"
        );
        self.emit(AgentEvent::TaskStarted {
            session_id: self.session.id.clone(),
            instruction: task.instruction.clone(),
        });

        let mut ctl = LoopController::new(
            LoopConfig::from_settings(&self.agent, task.max_turns),
            self.cancel.clone(),
        );

        let classifier = self.classifier.clone();
        let excluded = if task.safety_strict {
            self.strict_excluded.clone()
        } else {
            Vec::new()
        };
        self.dispatcher.set_excluded(excluded.clone());
        let tools = browser_tools(&excluded);

        // ── Initializing ────────────────────────────────────────────────────
        if let Err((termination, error)) = self.initialize(&task).await {
            return self.finish(&ctl, AgentState::Failed, termination, None, Some(error));
        }
        self.session.status = AgentState::Running;
        tracing::info!(session = %self.session.id, "Initializing → Running");

        // ── Running ─────────────────────────────────────────────────────────
        loop {
            if let Some(termination) = ctl.check_before_turn(self.session.turn) {
                let error = match termination {
                    Termination::CallerCancelled => {
                        self.dispatcher.shutdown().await;
                        WebClawError::Cancelled.to_string()
                    }
                    Termination::DeadlineExceeded => format!(
                        "task deadline of {}s exceeded",
                        self.agent.max_task_seconds.unwrap_or_default()
                    ),
                    _ => WebClawError::MaxTurnsExceeded(ctl.max_turns()).to_string(),
                };
                return self.finish(&ctl, AgentState::Failed, termination, None, Some(error));
            }

            let turn = self.session.turn + 1;
            tracing::info!(turn, "turn started");
            self.emit(AgentEvent::TurnStarted { turn });

            let messages = self.record.conversation.render();
            let reply = tokio::select! {
                reply = self.provider.chat(messages, tools.clone(), &self.call_config) => reply,
                _ = self.cancel.cancelled() => {
                    // Picked up by the check at the top of the loop.
                    continue;
                }
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(turn, error = %e, "model call failed");
                    let error = WebClawError::ModelClient(e.to_string()).to_string();
                    return self
                        .finish(&ctl, AgentState::Failed, Termination::ModelClientFailure, None, Some(error));
                }
            };

            if !reply.reasoning.is_empty() {
                tracing::debug!(turn, reasoning = %reply.reasoning, "model reasoning");
            }
            self.push_entry(ConversationEntry::Assistant {
                text: reply.content.clone(),
                reasoning: reply.reasoning.clone(),
                tool_calls: reply.tool_calls.clone(),
            });

            if reply.tool_calls.is_empty() {
                self.session.turn = turn;
                tracing::info!(turn, "final answer received");
                let text = Some(reply.content.clone());
                return self
                    .finish(&ctl, AgentState::Succeeded, Termination::FinalAnswer, text, None);
            }

            tracing::info!(turn, count = reply.tool_calls.len(), "actions requested");
            let results = match self.run_actions(turn, &reply.tool_calls, &classifier).await {
                Ok(results) => results,
                Err((results, e)) => {
                    tracing::error!(turn, error = %e, "executor failure, aborting task");
                    self.complete_turn(turn, results);
                    return self
                        .finish(&ctl, AgentState::Failed, Termination::ExecutorFailure, None, Some(e.to_string()));
                }
            };

            if self.cancel.is_cancelled() {
                // Not a safety outcome; the check at the top of the loop tears down.
                self.complete_turn(turn, results);
                continue;
            }

            let verdict = ctl.record_turn(&results);
            self.complete_turn(turn, results);

            match verdict {
                TurnVerdict::Progress => {}
                TurnVerdict::NoProgress { streak } => {
                    tracing::warn!(turn, streak, "no action succeeded this turn");
                }
                TurnVerdict::Stop(Termination::AllActionsDenied) => {
                    tracing::warn!(turn, "every action was denied, stopping");
                    let error = WebClawError::ActionDenied(
                        "all requested actions were denied".into(),
                    )
                    .to_string();
                    return self
                        .finish(&ctl, AgentState::Cancelled, Termination::AllActionsDenied, None, Some(error));
                }
                TurnVerdict::Stop(termination) => {
                    tracing::warn!(turn, "no progress for too many turns, stopping");
                    let error = format!(
                        "all actions failed in {} consecutive turns",
                        self.agent.failed_turn_limit.max(1)
                    );
                    return self
                        .finish(&ctl, AgentState::Failed, termination, None, Some(error));
                }
            }
        }
    }

    /// Opens the start URL (through the domain gate), takes the first
    /// snapshot, and seeds the conversation.
    async fn initialize(&mut self, task: &TaskRequest) -> Result<(), (Termination, String)> {
        let mut note = None;
        if let Some(url) = task.start_url.as_deref() {
            if let Err(e) = self.domain_gate.check(url) {
                tracing::warn!(url, "start URL rejected by domain gate");
                return Err((Termination::StartUrlRejected, e.to_string()));
            }
            match self.dispatcher.navigate_to(url).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err((Termination::ExecutorFailure, e.to_string())),
                Err(e) => {
                    tracing::warn!(url, error = %e, "opening start URL failed");
                    note = Some(format!("Opening the start URL {url} failed: {e}"));
                }
            }
        }

        let snapshot = self
            .dispatcher
            .capture_snapshot()
            .await
            .map_err(|e| (Termination::ExecutorFailure, e.to_string()))?;
        self.session.observe(&snapshot);

        let system = self
            .agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| SYSTEM_PROMPT.to_string());
        self.push_entry(ConversationEntry::System { text: system });

        let mut text = format!("Task: {}", task.instruction);
        if let Some(note) = note {
            text.push_str("\n\n");
            text.push_str(&note);
        }
        self.push_entry(ConversationEntry::User {
            text,
            snapshot: Some(snapshot),
        });
        Ok(())
    }

    /// Runs one turn's actions in order. On a fatal executor error the
    /// results gathered so far come back with the error.
    async fn run_actions(
        &mut self,
        turn: u32,
        calls: &[ToolCall],
        classifier: &SafetyClassifier,
    ) -> Result<Vec<ActionResult>, (Vec<ActionResult>, WebClawError)> {
        let mut results = Vec::with_capacity(calls.len());
        let mut cancel_rest = false;

        for call in calls {
            let action = match ActionRequest::from_tool_call(call) {
                Ok(action) => action,
                Err(e) => {
                    let placeholder = ActionRequest {
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        args: Map::new(),
                        declared_risk: None,
                    };
                    tracing::warn!(turn, action = %call.function.name, error = %e, "unusable tool call");
                    self.record_result(&mut results, ActionResult::error(&placeholder, e.to_string()));
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                let result = ActionResult::cancelled(&action, WebClawError::Cancelled.to_string());
                self.record_result(&mut results, result);
                continue;
            }

            if cancel_rest {
                let result = ActionResult::cancelled(
                    &action,
                    "Cancelled because an earlier action in this turn was denied",
                );
                self.record_result(&mut results, result);
                continue;
            }

            self.emit(AgentEvent::ActionRequested {
                turn,
                call_id: action.call_id.clone(),
                name: action.name.clone(),
                args: serde_json::Value::Object(action.args.clone()),
            });

            let verdict = classifier.classify(&action);
            let acknowledged = verdict.requires_confirmation;
            if verdict.requires_confirmation {
                tracing::warn!(turn, action = %action.name, reason = %verdict.reason, "confirmation required");
                self.emit(AgentEvent::ConfirmationRequired {
                    call_id: action.call_id.clone(),
                    name: action.name.clone(),
                    reason: verdict.reason.clone(),
                });
                let answer = tokio::select! {
                    approved = self.gate.confirm(&action, &verdict.reason) => Some(approved),
                    _ = self.cancel.cancelled() => None,
                };
                let Some(approved) = answer else {
                    tracing::info!(turn, action = %action.name, "task cancelled while awaiting confirmation");
                    let result = ActionResult::cancelled(&action, WebClawError::Cancelled.to_string());
                    self.record_result(&mut results, result);
                    continue;
                };
                if !approved {
                    tracing::info!(turn, action = %action.name, "action denied");
                    if self.agent.denial_policy == DenialPolicy::CancelRemaining {
                        cancel_rest = true;
                    }
                    self.record_result(&mut results, ActionResult::cancelled(&action, verdict.reason));
                    continue;
                }
                tracing::info!(turn, action = %action.name, "action approved");
            }

            if let Some(target) = self.dispatcher.navigation_target(&action) {
                if let Err(e) = self.domain_gate.check(&target) {
                    tracing::warn!(turn, url = %target, "navigation blocked by domain gate");
                    self.record_result(&mut results, ActionResult::error(&action, e.to_string()));
                    continue;
                }
            }

            match self.dispatcher.execute(&action).await {
                Ok(mut result) => {
                    if acknowledged && result.is_success() {
                        result
                            .payload
                            .insert("safety_acknowledged".into(), serde_json::Value::Bool(true));
                    }
                    self.record_result(&mut results, result);
                }
                Err(e) => return Err((results, e)),
            }
        }
        Ok(results)
    }

    fn record_result(&self, results: &mut Vec<ActionResult>, result: ActionResult) {
        tracing::info!(
            action = %result.name,
            status = ?result.status,
            error = result.error.as_deref().unwrap_or(""),
            "action finished"
        );
        self.emit(AgentEvent::ActionCompleted {
            call_id: result.call_id.clone(),
            name: result.name.clone(),
            status: result.status,
            error: result.error.clone(),
        });
        results.push(result);
    }

    /// Appends the observation and advances the turn counter.
    fn complete_turn(&mut self, turn: u32, results: Vec<ActionResult>) {
        let snapshot = self.dispatcher.latest_snapshot().cloned();
        if let Some(snap) = &snapshot {
            self.session.observe(snap);
        }
        self.session.turn = turn;
        self.record.turn_summaries.push(TurnSummary::from_results(
            turn,
            &results,
            &self.session.current_url,
        ));
        self.push_entry(ConversationEntry::Observation { results, snapshot });
        self.emit(AgentEvent::TurnCompleted {
            turn,
            url: self.session.current_url.clone(),
            title: self.session.current_title.clone(),
        });
    }

    fn push_entry(&mut self, entry: ConversationEntry) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&self.session.id, self.session.turn, &entry) {
                tracing::warn!(error = %e, "journal write failed");
            }
        }
        self.record.conversation.push(entry);
    }

    fn finish(
        &mut self,
        ctl: &LoopController,
        status: AgentState,
        termination: Termination,
        final_response_text: Option<String>,
        error: Option<String>,
    ) -> AgentOutcome {
        self.session.status = status;
        let outcome = AgentOutcome {
            session_id: self.session.id.clone(),
            success: status == AgentState::Succeeded,
            status,
            termination,
            turns_completed: self.session.turn,
            final_url: self.session.current_url.clone(),
            final_title: self.session.current_title.clone(),
            execution_time_ms: ctl.elapsed().as_millis() as u64,
            final_response_text,
            error,
        };

        self.record.sync(&self.session);
        self.record.termination = Some(termination);
        self.record.outcome = Some(outcome.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.record) {
                tracing::warn!(error = %e, "saving session record failed");
            }
        }

        tracing::info!(
            session = %outcome.session_id,
            status = ?outcome.status,
            termination = ?outcome.termination,
            turns = outcome.turns_completed,
            elapsed_ms = outcome.execution_time_ms,
            "task finished"
        );
        self.emit(AgentEvent::TaskFinished {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}
