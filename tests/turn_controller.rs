use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use webclaw::agent_engine::engine::TurnController;
use webclaw::agent_engine::event_bus::{AgentEvent, EventBus};
use webclaw::agent_engine::history::{ConversationEntry, SessionStore};
use webclaw::agent_engine::state::{ActionRequest, ActionStatus, AgentState, TaskRequest, Termination};
use webclaw::config::{AppConfig, DenialPolicy};
use webclaw::executor::confirm::{ConfirmationGate, PolicyGate};
use webclaw::executor::dispatcher::{ActionDispatcher, DispatchSettings};
use webclaw::executor::memory::MemoryDriver;
use webclaw::llm::providers::scripted::{action_reply, ScriptedProvider};
use webclaw::llm::types::{CallConfig, LlmResponse};

fn call_config() -> CallConfig {
    CallConfig {
        model: "scripted".into(),
        stream: false,
        temperature: 0.0,
    }
}

fn build(
    provider: Arc<ScriptedProvider>,
    driver: &MemoryDriver,
    gate: Box<dyn ConfirmationGate>,
    config: &AppConfig,
) -> TurnController {
    let dispatcher = ActionDispatcher::new(
        Box::new(driver.clone()),
        DispatchSettings::from(&config.browser),
    );
    TurnController::new(provider, call_config(), dispatcher, gate, config)
}

fn scripted(replies: Vec<LlmResponse>) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(replies))
}

/// (name, status, error) of every action result, in order.
fn results_of(controller: &TurnController) -> Vec<(String, ActionStatus, Option<String>)> {
    controller
        .conversation()
        .entries()
        .iter()
        .filter_map(|e| match e {
            ConversationEntry::Observation { results, .. } => Some(results.clone()),
            _ => None,
        })
        .flatten()
        .map(|r| (r.name, r.status, r.error))
        .collect()
}

fn declared_risky_click() -> serde_json::Value {
    json!({
        "x": 10,
        "y": 10,
        "safety_decision": {"decision": "require_confirmation", "explanation": "Accept the terms of service"}
    })
}

#[tokio::test]
async fn scenario_a_immediate_final_answer() {
    let provider = scripted(vec![LlmResponse::text("Nothing to do.")]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("say hello")).await;

    assert!(outcome.success);
    assert_eq!(outcome.status, AgentState::Succeeded);
    assert_eq!(outcome.termination, Termination::FinalAnswer);
    assert_eq!(outcome.turns_completed, 1);
    assert_eq!(outcome.final_response_text.as_deref(), Some("Nothing to do."));
    assert_eq!(outcome.final_url, "about:blank");
    assert!(outcome.error.is_none());

    // system + task + assistant
    assert_eq!(controller.conversation().len(), 3);
    assert_eq!(provider.calls().len(), 1);
    assert!(driver.ops().is_empty());
}

#[tokio::test]
async fn scenario_b_disallowed_domain_then_retry() {
    let provider = scripted(vec![
        action_reply(&[("navigate", json!({"url": "https://evil.test/"}))]),
        action_reply(&[("navigate", json!({"url": "https://docs.example.com/start"}))]),
        LlmResponse::text("Opened the docs."),
    ]);
    let driver = MemoryDriver::default().with_page("https://docs.example.com/start", "Docs");
    let mut config = AppConfig::default();
    config.safety.allowed_domains = vec!["*.example.com".into()];
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("open the docs")).await;

    assert!(outcome.success);
    assert!(outcome.turns_completed >= 2);
    assert_eq!(outcome.final_url, "https://docs.example.com/start");
    assert_eq!(outcome.final_title, "Docs");

    let results = results_of(&controller);
    assert_eq!(results[0].1, ActionStatus::Error);
    assert!(results[0].2.as_deref().unwrap_or("").contains("Domain not allowed"));
    assert_eq!(results[1].1, ActionStatus::Success);
    // The blocked URL never reached the browser.
    assert_eq!(driver.ops(), vec!["navigate https://docs.example.com/start".to_string()]);
}

#[tokio::test]
async fn scenario_c_denied_action_does_not_end_task() {
    let provider = scripted(vec![
        action_reply(&[("click_at", declared_risky_click())]),
        action_reply(&[("click_at", json!({"x": 500, "y": 500}))]),
        LlmResponse::text("Clicked the button."),
    ]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("press the button")).await;

    assert!(outcome.success);
    assert_eq!(outcome.turns_completed, 3);
    let results = results_of(&controller);
    assert_eq!(results[0].1, ActionStatus::Cancelled);
    assert_eq!(results[0].2.as_deref(), Some("Accept the terms of service"));
    assert_eq!(results[1].1, ActionStatus::Success);
    assert_eq!(driver.ops(), vec!["click 720,450".to_string()]);
}

#[tokio::test]
async fn all_denied_turn_at_limit_is_cancelled() {
    let provider = scripted(vec![action_reply(&[("click_at", declared_risky_click())])]);
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.agent.failed_turn_limit = 1;
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("press the button")).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, AgentState::Cancelled);
    assert_eq!(outcome.termination, Termination::AllActionsDenied);
    assert_eq!(outcome.turns_completed, 1);
}

#[tokio::test]
async fn scenario_d_every_action_fails_until_max_turns() {
    let bad_click = || action_reply(&[("click_at", json!({"x": 1500, "y": 10}))]);
    let provider = scripted(vec![bad_click(), bad_click(), bad_click()]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller
        .run(TaskRequest::new("click off screen").with_max_turns(2))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::MaxTurnsExceeded);
    assert_eq!(outcome.turns_completed, 2);
    assert!(outcome.error.unwrap().contains("Max turns exceeded"));
    assert!(results_of(&controller)
        .iter()
        .all(|(_, status, _)| *status == ActionStatus::Error));
}

#[tokio::test]
async fn consecutive_failed_turns_stop_the_task() {
    let bad_click = || action_reply(&[("click_at", json!({"x": -1, "y": 10}))]);
    let provider = scripted(vec![bad_click(), bad_click(), bad_click()]);
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.agent.failed_turn_limit = 2;
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("click off screen")).await;

    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::AllActionsFailed);
    assert_eq!(outcome.turns_completed, 2);
    assert!(outcome.error.unwrap().contains("all actions failed"));
    assert_eq!(provider.calls().len(), 2);
}

#[tokio::test]
async fn approved_action_is_acknowledged() {
    let provider = scripted(vec![
        action_reply(&[("click_at", declared_risky_click())]),
        LlmResponse::text("Accepted."),
    ]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider, &driver, Box::new(PolicyGate::allow_all()), &config);

    let outcome = controller.run(TaskRequest::new("accept the terms")).await;
    assert!(outcome.success);

    let observation = controller
        .conversation()
        .entries()
        .iter()
        .find_map(|e| match e {
            ConversationEntry::Observation { results, .. } => Some(results[0].clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(observation.status, ActionStatus::Success);
    assert_eq!(observation.payload["safety_acknowledged"], json!(true));
}

#[tokio::test]
async fn approved_navigation_still_checks_domain() {
    let provider = scripted(vec![
        action_reply(&[(
            "navigate",
            json!({
                "url": "https://evil.test/",
                "safety_decision": {"decision": "require_confirmation", "explanation": "leaving site"}
            }),
        )]),
        LlmResponse::text("Stopped."),
    ]);
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.safety.allowed_domains = vec!["example.com".into()];
    let mut controller = build(provider, &driver, Box::new(PolicyGate::allow_all()), &config);

    controller.run(TaskRequest::new("go elsewhere")).await;

    let results = results_of(&controller);
    assert_eq!(results[0].1, ActionStatus::Error);
    assert!(driver.ops().is_empty());
}

#[tokio::test]
async fn denial_policy_controls_siblings() {
    let turn = || {
        action_reply(&[
            ("click_at", declared_risky_click()),
            ("go_back", json!({})),
        ])
    };

    // Independent: the sibling still runs.
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(
        scripted(vec![turn(), LlmResponse::text("ok")]),
        &driver,
        Box::new(PolicyGate::deny_all()),
        &config,
    );
    controller.run(TaskRequest::new("t")).await;
    let statuses: Vec<ActionStatus> = results_of(&controller).into_iter().map(|r| r.1).collect();
    assert_eq!(statuses, vec![ActionStatus::Cancelled, ActionStatus::Success]);
    assert_eq!(driver.ops(), vec!["back".to_string()]);

    // CancelRemaining: the sibling is cancelled without running.
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.agent.denial_policy = DenialPolicy::CancelRemaining;
    let mut controller = build(
        scripted(vec![turn(), LlmResponse::text("ok")]),
        &driver,
        Box::new(PolicyGate::deny_all()),
        &config,
    );
    controller.run(TaskRequest::new("t")).await;
    let statuses: Vec<ActionStatus> = results_of(&controller).into_iter().map(|r| r.1).collect();
    assert_eq!(statuses, vec![ActionStatus::Cancelled, ActionStatus::Cancelled]);
    assert!(driver.ops().is_empty());
}

#[tokio::test]
async fn strictness_changes_vocabulary_not_classification() {
    let script = || {
        vec![
            action_reply(&[("delete_file", json!({"path": "/tmp/x"}))]),
            LlmResponse::text("done"),
        ]
    };
    let config = AppConfig::default();

    let strict_provider = scripted(script());
    let mut strict = build(
        strict_provider.clone(),
        &MemoryDriver::default(),
        Box::new(PolicyGate::deny_all()),
        &config,
    );
    strict.run(TaskRequest::new("clean up")).await;
    assert_eq!(results_of(&strict)[0].1, ActionStatus::Cancelled);
    assert!(!strict_provider.declared_tools()[0].contains(&"key_combination".to_string()));

    let loose_provider = scripted(script());
    let mut loose = build(
        loose_provider.clone(),
        &MemoryDriver::default(),
        Box::new(PolicyGate::deny_all()),
        &config,
    );
    loose
        .run(TaskRequest::new("clean up").with_safety_strict(false))
        .await;
    let results = results_of(&loose);
    assert_eq!(results[0].1, ActionStatus::Cancelled);
    assert!(results[0].2.as_deref().unwrap_or("").contains("high-risk"));
    assert!(loose_provider.declared_tools()[0].contains(&"key_combination".to_string()));
}

#[tokio::test]
async fn gates_are_deterministic_across_controllers() {
    let script = || {
        vec![
            action_reply(&[
                ("navigate", json!({"url": "https://blocked.test/"})),
                ("click_at", declared_risky_click()),
                ("type_text_at", json!({"x": 1, "y": 1, "text": "my password is hunter2"})),
                ("hover_at", json!({"x": 2, "y": 3})),
            ]),
            LlmResponse::text("done"),
        ]
    };
    let mut config = AppConfig::default();
    config.safety.allowed_domains = vec!["example.com".into()];

    let mut first = build(scripted(script()), &MemoryDriver::default(), Box::new(PolicyGate::deny_all()), &config);
    let mut second = build(scripted(script()), &MemoryDriver::default(), Box::new(PolicyGate::deny_all()), &config);
    first.run(TaskRequest::new("same task")).await;
    second.run(TaskRequest::new("same task")).await;

    let a = results_of(&first);
    assert_eq!(a, results_of(&second));
    let statuses: Vec<ActionStatus> = a.iter().map(|r| r.1).collect();
    assert_eq!(
        statuses,
        vec![
            ActionStatus::Error,
            ActionStatus::Cancelled,
            ActionStatus::Cancelled,
            ActionStatus::Success
        ]
    );
}

#[tokio::test]
async fn start_url_outside_allow_list_fails_immediately() {
    let provider = scripted(vec![LlmResponse::text("never asked")]);
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.safety.allowed_domains = vec!["example.com".into()];
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller
        .run(TaskRequest::new("t").with_start_url("https://example.com.evil.com/"))
        .await;

    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::StartUrlRejected);
    assert_eq!(outcome.turns_completed, 0);
    assert!(provider.calls().is_empty());
    assert!(driver.ops().is_empty());
}

#[tokio::test]
async fn start_url_is_opened_before_first_turn() {
    let provider = scripted(vec![LlmResponse::text("Read it.")]);
    let driver = MemoryDriver::default().with_page("https://example.com/", "Example Domain");
    let mut config = AppConfig::default();
    config.safety.allowed_domains = vec!["example.com".into()];
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller
        .run(TaskRequest::new("read the page").with_start_url("https://example.com/"))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.final_title, "Example Domain");
    let first_request = &provider.calls()[0];
    assert!(first_request[1].text_content().contains("Example Domain"));
}

#[tokio::test]
async fn model_failure_aborts_with_conversation_kept() {
    let provider = scripted(vec![action_reply(&[("go_back", json!({}))])]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("t")).await;

    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::ModelClientFailure);
    assert_eq!(outcome.turns_completed, 1);
    assert!(outcome.error.unwrap().contains("Model client failure"));
    assert!(matches!(
        controller.conversation().last(),
        Some(ConversationEntry::Observation { .. })
    ));
}

#[tokio::test]
async fn lost_browser_is_fatal() {
    let provider = scripted(vec![LlmResponse::text("unused")]);
    let driver = MemoryDriver::default();
    driver.lose_connection();
    let config = AppConfig::default();
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);

    let outcome = controller.run(TaskRequest::new("t")).await;

    assert_eq!(outcome.termination, Termination::ExecutorFailure);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn caller_cancellation_closes_browser() {
    let provider = scripted(vec![LlmResponse::text("unused")]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider.clone(), &driver, Box::new(PolicyGate::deny_all()), &config);
    controller.cancellation_token().cancel();

    let outcome = controller.run(TaskRequest::new("t")).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::CallerCancelled);
    assert!(driver.is_closed());
    assert!(provider.calls().is_empty());
}

/// Cancels the task from inside the approval wait and never answers.
struct CancellingGate(CancellationToken);

#[async_trait]
impl ConfirmationGate for CancellingGate {
    async fn confirm(&self, _action: &ActionRequest, _reason: &str) -> bool {
        self.0.cancel();
        std::future::pending().await
    }
}

#[tokio::test]
async fn cancellation_during_confirmation_stops_the_turn() {
    let provider = scripted(vec![
        action_reply(&[("click_at", declared_risky_click()), ("go_back", json!({}))]),
        LlmResponse::text("unused"),
    ]);
    let driver = MemoryDriver::default();
    let mut config = AppConfig::default();
    config.agent.failed_turn_limit = 1;
    let token = CancellationToken::new();
    let mut controller = build(
        provider.clone(),
        &driver,
        Box::new(CancellingGate(token.clone())),
        &config,
    )
    .with_cancellation(token);

    let outcome = controller.run(TaskRequest::new("t")).await;

    assert_eq!(outcome.status, AgentState::Failed);
    assert_eq!(outcome.termination, Termination::CallerCancelled);
    assert_eq!(outcome.error.as_deref(), Some("Task cancelled"));
    assert!(driver.is_closed());
    // The sibling never reached the browser.
    assert_eq!(driver.ops(), vec!["close".to_string()]);
    assert_eq!(provider.calls().len(), 1);

    let results = results_of(&controller);
    assert_eq!(results.len(), 2);
    for (_, status, error) in &results {
        assert_eq!(*status, ActionStatus::Cancelled);
        assert_eq!(error.as_deref(), Some("Task cancelled"));
    }
}

#[tokio::test]
async fn events_and_session_record_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    let provider = scripted(vec![
        action_reply(&[("scroll_document", json!({"direction": "down"}))]),
        LlmResponse::text("Scrolled."),
    ]);
    let driver = MemoryDriver::default();
    let config = AppConfig::default();
    let mut controller = build(provider, &driver, Box::new(PolicyGate::deny_all()), &config)
        .with_event_bus(bus)
        .with_session_store(store.clone());

    let outcome = controller.run(TaskRequest::new("scroll")).await;
    assert!(outcome.success);

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(match event {
            AgentEvent::TaskStarted { .. } => "task_started",
            AgentEvent::TurnStarted { .. } => "turn_started",
            AgentEvent::ActionRequested { .. } => "action_requested",
            AgentEvent::ConfirmationRequired { .. } => "confirmation_required",
            AgentEvent::ActionCompleted { .. } => "action_completed",
            AgentEvent::TurnCompleted { .. } => "turn_completed",
            AgentEvent::TaskFinished { .. } => "task_finished",
        });
    }
    assert_eq!(
        names,
        vec![
            "task_started",
            "turn_started",
            "action_requested",
            "action_completed",
            "turn_completed",
            "turn_started",
            "task_finished"
        ]
    );

    let record = store.load(&outcome.session_id).unwrap();
    assert_eq!(record.status, AgentState::Succeeded);
    assert_eq!(record.turns, 2);
    assert_eq!(record.turn_summaries.len(), 1);
    assert_eq!(record.turn_summaries[0].succeeded, 1);
    assert_eq!(record.termination, Some(Termination::FinalAnswer));
    assert_eq!(
        store.read_journal(&outcome.session_id).unwrap().len(),
        controller.conversation().len()
    );
}
