// Human-in-the-loop approval for actions the safety classifier flags.
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::agent_engine::state::ActionRequest;
use crate::config::{ConfirmationMode, SafetyConfig};

/// Asks an approver whether a flagged action may run.
/// `true` approves; anything else (including a vanished approver) denies.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, action: &ActionRequest, reason: &str) -> bool;
}

/// Fixed decisions, optionally approving a list of action names up front and
/// deferring everything else to another gate.
pub struct PolicyGate {
    approved_names: Vec<String>,
    default_decision: bool,
    fallback: Option<Box<dyn ConfirmationGate>>,
}

impl PolicyGate {
    pub fn deny_all() -> Self {
        Self {
            approved_names: Vec::new(),
            default_decision: false,
            fallback: None,
        }
    }

    pub fn allow_all() -> Self {
        Self {
            default_decision: true,
            ..Self::deny_all()
        }
    }

    /// Approves only the named actions.
    pub fn allow_listed(names: Vec<String>) -> Self {
        Self {
            approved_names: names,
            ..Self::deny_all()
        }
    }

    /// Sends anything not approved by name to `gate` instead of the default.
    pub fn or_ask(mut self, gate: Box<dyn ConfirmationGate>) -> Self {
        self.fallback = Some(gate);
        self
    }
}

#[async_trait]
impl ConfirmationGate for PolicyGate {
    async fn confirm(&self, action: &ActionRequest, reason: &str) -> bool {
        if self.approved_names.iter().any(|n| n == &action.name) {
            tracing::info!(action = %action.name, "auto-approved by policy");
            return true;
        }
        match &self.fallback {
            Some(gate) => gate.confirm(action, reason).await,
            None => {
                tracing::info!(
                    action = %action.name,
                    approved = self.default_decision,
                    reason,
                    "confirmation decided by policy"
                );
                self.default_decision
            }
        }
    }
}

/// A pending decision handed to whatever presents it to a human.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub action: ActionRequest,
    pub reason: String,
    responder: oneshot::Sender<bool>,
}

impl ConfirmationRequest {
    pub fn respond(self, approved: bool) {
        // The controller may have given up waiting; nothing to do then.
        let _ = self.responder.send(approved);
    }

    pub fn approve(self) {
        self.respond(true);
    }

    pub fn deny(self) {
        self.respond(false);
    }
}

/// Forwards each decision over a channel and waits for the reply.
pub struct ChannelGate {
    tx: mpsc::Sender<ConfirmationRequest>,
}

impl ChannelGate {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationGate for ChannelGate {
    async fn confirm(&self, action: &ActionRequest, reason: &str) -> bool {
        let (responder, decision) = oneshot::channel();
        let request = ConfirmationRequest {
            action: action.clone(),
            reason: reason.to_string(),
            responder,
        };
        if self.tx.send(request).await.is_err() {
            tracing::warn!(action = %action.name, "no approver listening, denying");
            return false;
        }
        match decision.await {
            Ok(approved) => approved,
            Err(_) => {
                tracing::warn!(action = %action.name, "approver dropped the request, denying");
                false
            }
        }
    }
}

type PromptReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type PromptWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Asks on the terminal: `y`/`yes` approves, anything else denies.
pub struct ConsoleGate {
    io: Mutex<(PromptReader, PromptWriter)>,
}

impl ConsoleGate {
    pub fn stdio() -> Self {
        Self::from_io(Box::new(tokio::io::stdin()), Box::new(tokio::io::stderr()))
    }

    pub fn from_io(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            io: Mutex::new((BufReader::new(reader), writer)),
        }
    }
}

#[async_trait]
impl ConfirmationGate for ConsoleGate {
    async fn confirm(&self, action: &ActionRequest, reason: &str) -> bool {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;

        let args = serde_json::Value::Object(action.args.clone());
        let prompt = format!(
            "\n[webclaw] confirmation required: {reason}\n  action: {} {args}\nAllow? (y/N): ",
            action.name
        );
        if let Err(e) = writer.write_all(prompt.as_bytes()).await {
            tracing::warn!(error = %e, "could not write confirmation prompt");
            return false;
        }
        let _ = writer.flush().await;

        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }
}

/// Denies when the wrapped gate does not answer in time.
pub struct TimeoutGate {
    inner: Box<dyn ConfirmationGate>,
    limit: Duration,
}

impl TimeoutGate {
    pub fn new(inner: Box<dyn ConfirmationGate>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl ConfirmationGate for TimeoutGate {
    async fn confirm(&self, action: &ActionRequest, reason: &str) -> bool {
        match tokio::time::timeout(self.limit, self.inner.confirm(action, reason)).await {
            Ok(approved) => approved,
            Err(_) => {
                tracing::warn!(
                    action = %action.name,
                    timeout_secs = self.limit.as_secs(),
                    "confirmation timed out, denying"
                );
                false
            }
        }
    }
}

/// Builds the gate described by `[safety]`.
pub fn gate_from_config(safety: &SafetyConfig) -> Box<dyn ConfirmationGate> {
    let base = match safety.confirmation {
        ConfirmationMode::Deny => PolicyGate::deny_all(),
        ConfirmationMode::Allow => PolicyGate::allow_all(),
        ConfirmationMode::Prompt => PolicyGate::deny_all().or_ask(Box::new(ConsoleGate::stdio())),
    };
    let gate = PolicyGate {
        approved_names: safety.auto_approve_actions.clone(),
        ..base
    };
    match safety.confirmation_timeout_secs {
        Some(secs) => Box::new(TimeoutGate::new(Box::new(gate), Duration::from_secs(secs))),
        None => Box::new(gate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(name: &str) -> ActionRequest {
        ActionRequest {
            call_id: "call_1".into(),
            name: name.into(),
            args: json!({"x": 1}).as_object().cloned().unwrap_or_default(),
            declared_risk: None,
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl ConfirmationGate for NeverAnswers {
        async fn confirm(&self, _action: &ActionRequest, _reason: &str) -> bool {
            std::future::pending::<bool>().await
        }
    }

    #[tokio::test]
    async fn policy_decisions() {
        assert!(!PolicyGate::deny_all().confirm(&action("click_at"), "r").await);
        assert!(PolicyGate::allow_all().confirm(&action("click_at"), "r").await);

        let listed = PolicyGate::allow_listed(vec!["navigate".into()]);
        assert!(listed.confirm(&action("navigate"), "r").await);
        assert!(!listed.confirm(&action("click_at"), "r").await);
    }

    #[tokio::test]
    async fn policy_defers_to_fallback() {
        let gate = PolicyGate::allow_listed(vec!["navigate".into()])
            .or_ask(Box::new(PolicyGate::allow_all()));
        assert!(gate.confirm(&action("click_at"), "r").await);
    }

    #[tokio::test]
    async fn channel_gate_round_trip() {
        let (gate, mut rx) = ChannelGate::new(4);
        let approver = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.reason, "needs a human");
            let approve = req.action.name == "click_at";
            req.respond(approve);
            let req = rx.recv().await.unwrap();
            req.deny();
        });
        assert!(gate.confirm(&action("click_at"), "needs a human").await);
        assert!(!gate.confirm(&action("navigate"), "needs a human").await);
        approver.await.unwrap();
    }

    #[tokio::test]
    async fn channel_gate_denies_without_approver() {
        let (gate, rx) = ChannelGate::new(1);
        drop(rx);
        assert!(!gate.confirm(&action("click_at"), "r").await);
    }

    #[tokio::test]
    async fn console_gate_reads_answer() {
        let gate = ConsoleGate::from_io(Box::new(&b"yes\n"[..]), Box::new(tokio::io::sink()));
        assert!(gate.confirm(&action("click_at"), "r").await);

        let gate = ConsoleGate::from_io(Box::new(&b"n\n"[..]), Box::new(tokio::io::sink()));
        assert!(!gate.confirm(&action("click_at"), "r").await);

        let gate = ConsoleGate::from_io(Box::new(&b""[..]), Box::new(tokio::io::sink()));
        assert!(!gate.confirm(&action("click_at"), "r").await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_gate_denies_on_expiry() {
        let gate = TimeoutGate::new(Box::new(NeverAnswers), Duration::from_secs(30));
        assert!(!gate.confirm(&action("click_at"), "r").await);
    }

    #[tokio::test]
    async fn config_builds_auto_approving_gate() {
        let safety = SafetyConfig {
            confirmation: ConfirmationMode::Deny,
            auto_approve_actions: vec!["take_screenshot".into()],
            ..SafetyConfig::default()
        };
        let gate = gate_from_config(&safety);
        assert!(gate.confirm(&action("take_screenshot"), "r").await);
        assert!(!gate.confirm(&action("navigate"), "r").await);
    }
}
