use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{WebClawError, WebClawResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. If a role is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var WEBCLAW_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Maps agent roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Vision + function-calling model that drives the browser.
    pub tools: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    #[serde(default = "default_true")]
    pub stream: bool,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

fn default_temperature() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DenialPolicy {
    /// A denied action does not affect its siblings in the same turn.
    #[default]
    Independent,
    /// A denied action cancels every sibling that has not executed yet.
    CancelRemaining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Wall-clock ceiling for a whole task.
    #[serde(default)]
    pub max_task_seconds: Option<u64>,
    /// Consecutive turns without a single successful action before the task stops.
    #[serde(default = "default_failed_turn_limit")]
    pub failed_turn_limit: u32,
    #[serde(default)]
    pub denial_policy: DenialPolicy,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_task_seconds: None,
            failed_turn_limit: default_failed_turn_limit(),
            denial_policy: DenialPolicy::default(),
            system_prompt: None,
            sessions_dir: None,
        }
    }
}

fn default_max_turns() -> u32 {
    20
}

fn default_failed_turn_limit() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            width: default_width(),
            height: default_height(),
            action_timeout_ms: default_action_timeout_ms(),
            search_url: default_search_url(),
            wait_seconds: default_wait_seconds(),
        }
    }
}

fn default_width() -> u32 {
    1440
}

fn default_height() -> u32 {
    900
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_search_url() -> String {
    "https://www.google.com".into()
}

fn default_wait_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Unattended: every flagged action is refused.
    #[default]
    Deny,
    Allow,
    /// Ask on the terminal.
    Prompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub strict: bool,
    /// Empty means navigation is unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_high_risk_actions")]
    pub high_risk_actions: Vec<String>,
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
    #[serde(default = "default_strict_excluded_actions")]
    pub strict_excluded_actions: Vec<String>,
    #[serde(default)]
    pub confirmation: ConfirmationMode,
    /// Action names approved without asking, even when flagged.
    #[serde(default)]
    pub auto_approve_actions: Vec<String>,
    #[serde(default)]
    pub confirmation_timeout_secs: Option<u64>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            strict: true,
            allowed_domains: Vec::new(),
            high_risk_actions: default_high_risk_actions(),
            sensitive_patterns: default_sensitive_patterns(),
            strict_excluded_actions: default_strict_excluded_actions(),
            confirmation: ConfirmationMode::default(),
            auto_approve_actions: Vec::new(),
            confirmation_timeout_secs: None,
        }
    }
}

fn default_high_risk_actions() -> Vec<String> {
    [
        "delete", "remove", "install", "download", "sudo", "admin", "root", "password",
        "payment", "purchase", "checkout", "transfer", "upload",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        "password", "credential", "api key", "api_key", "secret", "token", "credit card",
        "card number", "cvv", "bank", "iban", "ssn", "legal", "contract",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_strict_excluded_actions() -> Vec<String> {
    vec!["key_combination".into(), "drag_and_drop".into()]
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> WebClawResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(WebClawError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Loads config.toml from an explicit path or the default search locations.
pub fn load_config(path: Option<&Path>) -> WebClawResult<AppConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => resolve_config_path()?,
    };
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn parse_config(content: &str) -> WebClawResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.agent.max_turns == 0 {
        return Err(WebClawError::Config("agent.max_turns must be at least 1".into()));
    }
    if config.browser.width == 0 || config.browser.height == 0 {
        return Err(WebClawError::Config("browser viewport must be non-empty".into()));
    }
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> WebClawResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(
            r#"
            [llm]
            active_provider = "openai"

            [llm.providers.openai]
            display_name = "OpenAI"
            api_base = "https://api.openai.com/v1/chat/completions"
            model = "gpt-4o"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.agent.max_turns, 20);
        assert_eq!(cfg.agent.failed_turn_limit, 3);
        assert_eq!(cfg.agent.denial_policy, DenialPolicy::Independent);
        assert_eq!(cfg.browser.width, 1440);
        assert_eq!(cfg.browser.height, 900);
        assert!(cfg.safety.strict);
        assert_eq!(cfg.safety.confirmation, ConfirmationMode::Deny);
        assert!(cfg.safety.high_risk_actions.iter().any(|p| p == "delete"));
        assert_eq!(cfg.llm.providers["openai"].temperature, 0.1);
    }

    #[test]
    fn rejects_zero_max_turns() {
        let err = parse_config("[agent]\nmax_turns = 0\n").unwrap_err();
        assert!(matches!(err, WebClawError::Config(_)));
    }

    #[test]
    fn parses_safety_section() {
        let cfg = parse_config(
            r#"
            [safety]
            strict = false
            allowed_domains = ["*.example.com"]
            confirmation = "prompt"
            confirmation_timeout_secs = 30

            [agent]
            denial_policy = "cancel_remaining"
            "#,
        )
        .unwrap();
        assert!(!cfg.safety.strict);
        assert_eq!(cfg.safety.allowed_domains, vec!["*.example.com".to_string()]);
        assert_eq!(cfg.safety.confirmation, ConfirmationMode::Prompt);
        assert_eq!(cfg.safety.confirmation_timeout_secs, Some(30));
        assert_eq!(cfg.agent.denial_policy, DenialPolicy::CancelRemaining);
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(include_str!("../config.example.toml")).unwrap();
        assert_eq!(cfg.llm.providers.len(), 2);
        assert_eq!(cfg.llm.roles.tools.as_ref().map(|r| r.provider.as_str()), Some("openai"));
        assert!(cfg.safety.allowed_domains.is_empty());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.agent.max_turns = 7;
        cfg.safety.allowed_domains = vec!["example.com".into()];
        save_config(&cfg, &path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.agent.max_turns, 7);
        assert_eq!(loaded.safety.allowed_domains, vec!["example.com".to_string()]);
    }
}
