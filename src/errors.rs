use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebClawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Domain not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Action execution error: {0}")]
    ActionExecution(String),

    #[error("Action denied: {0}")]
    ActionDenied(String),

    #[error("Model client failure: {0}")]
    ModelClient(String),

    #[error("Max turns exceeded ({0})")]
    MaxTurnsExceeded(u32),

    #[error("Browser error: {0}")]
    Browser(String),

    /// The browser connection is gone; no further action can succeed.
    #[error("Browser connection lost: {0}")]
    BrowserLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Task cancelled")]
    Cancelled,
}

impl WebClawError {
    /// Errors that end the whole task rather than a single action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WebClawError::BrowserLost(_)
                | WebClawError::ModelClient(_)
                | WebClawError::LlmProvider(_)
                | WebClawError::SseParsing(_)
                | WebClawError::Http(_)
                | WebClawError::Cancelled
        )
    }
}

impl serde::Serialize for WebClawError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type WebClawResult<T> = Result<T, WebClawError>;
