// Safety interceptor: decides which model-requested actions need human approval.
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::ActionRequest;
use crate::config::SafetyConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub requires_confirmation: bool,
    pub reason: String,
}

impl SafetyVerdict {
    fn allow() -> Self {
        Self {
            requires_confirmation: false,
            reason: String::new(),
        }
    }

    fn confirm(reason: impl Into<String>) -> Self {
        Self {
            requires_confirmation: true,
            reason: reason.into(),
        }
    }
}

/// Coarse substring heuristic. False positives are acceptable; it exists to
/// keep false negatives rare.
#[derive(Debug, Clone)]
pub struct SafetyClassifier {
    high_risk_actions: Vec<String>,
    sensitive_patterns: Vec<String>,
}

impl SafetyClassifier {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            high_risk_actions: lowercase_all(&config.high_risk_actions),
            sensitive_patterns: lowercase_all(&config.sensitive_patterns),
        }
    }

    /// Checks run in a fixed order and the first hit wins:
    /// declared risk, action name, then serialized arguments.
    /// Strictness only narrows the offered vocabulary; it never skips a check.
    pub fn classify(&self, action: &ActionRequest) -> SafetyVerdict {
        if let Some(risk) = action.declared_risk.as_ref().filter(|r| r.flag) {
            let reason = if risk.explanation.trim().is_empty() {
                format!("Model flagged '{}' as requiring confirmation", action.name)
            } else {
                risk.explanation.clone()
            };
            return SafetyVerdict::confirm(reason);
        }

        let name = action.name.to_lowercase();
        if let Some(pattern) = self.high_risk_actions.iter().find(|p| name.contains(p.as_str())) {
            return SafetyVerdict::confirm(format!(
                "Action '{}' involves high-risk operations ({pattern})",
                action.name
            ));
        }

        let args = serde_json::Value::Object(action.args.clone())
            .to_string()
            .to_lowercase();
        if self.sensitive_patterns.iter().any(|p| args.contains(p.as_str())) {
            return SafetyVerdict::confirm("Action involves sensitive data or operations");
        }

        SafetyVerdict::allow()
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
