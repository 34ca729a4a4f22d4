// Tool call dispatcher: uniform (name, args) requests → browser driver calls.
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::agent_engine::state::{ActionRequest, ActionResult, Snapshot};
use crate::config::BrowserSettings;
use crate::errors::{WebClawError, WebClawResult};
use crate::executor::coordinator::{denormalize_args, scale_magnitude, Viewport};
use crate::executor::driver::BrowserDriver;

const DEFAULT_SCROLL_MAGNITUDE: f64 = 800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Navigate,
    Search,
    ClickAt,
    HoverAt,
    TypeTextAt,
    ScrollDocument,
    ScrollAt,
    Wait,
    GoBack,
    GoForward,
    KeyCombination,
    TakeScreenshot,
    GetPageInfo,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        ActionKind::Navigate,
        ActionKind::Search,
        ActionKind::ClickAt,
        ActionKind::HoverAt,
        ActionKind::TypeTextAt,
        ActionKind::ScrollDocument,
        ActionKind::ScrollAt,
        ActionKind::Wait,
        ActionKind::GoBack,
        ActionKind::GoForward,
        ActionKind::KeyCombination,
        ActionKind::TakeScreenshot,
        ActionKind::GetPageInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Search => "search",
            ActionKind::ClickAt => "click_at",
            ActionKind::HoverAt => "hover_at",
            ActionKind::TypeTextAt => "type_text_at",
            ActionKind::ScrollDocument => "scroll_document",
            ActionKind::ScrollAt => "scroll_at",
            ActionKind::Wait => "wait",
            ActionKind::GoBack => "go_back",
            ActionKind::GoForward => "go_forward",
            ActionKind::KeyCombination => "key_combination",
            ActionKind::TakeScreenshot => "take_screenshot",
            ActionKind::GetPageInfo => "get_page_info",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wait_5_seconds" => Some(ActionKind::Wait),
            other => Self::ALL.iter().copied().find(|k| k.as_str() == other),
        }
    }

    /// Actions that load a new document and so must pass the domain gate.
    pub fn is_navigation(self) -> bool {
        matches!(self, ActionKind::Navigate | ActionKind::Search)
    }
}

/// Dispatcher knobs taken from `[browser]` plus the strict-mode exclusions.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub action_timeout: Duration,
    pub search_url: String,
    pub wait_seconds: u64,
    pub excluded: Vec<String>,
}

impl From<&BrowserSettings> for DispatchSettings {
    fn from(b: &BrowserSettings) -> Self {
        Self {
            action_timeout: Duration::from_millis(b.action_timeout_ms),
            search_url: b.search_url.clone(),
            wait_seconds: b.wait_seconds,
            excluded: Vec::new(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&BrowserSettings::default())
    }
}

/// Owns the browser handle and turns `ActionRequest`s into `ActionResult`s.
pub struct ActionDispatcher {
    driver: Box<dyn BrowserDriver>,
    settings: DispatchSettings,
    latest: Option<Snapshot>,
    closed: bool,
}

impl ActionDispatcher {
    pub fn new(driver: Box<dyn BrowserDriver>, settings: DispatchSettings) -> Self {
        Self {
            driver,
            settings,
            latest: None,
            closed: false,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.driver.viewport()
    }

    /// Replaces the set of action names refused outright.
    pub fn set_excluded(&mut self, excluded: Vec<String>) {
        self.settings.excluded = excluded;
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// URL a navigation-class request would load, if it names one.
    pub fn navigation_target(&self, action: &ActionRequest) -> Option<String> {
        match ActionKind::from_name(&action.name)? {
            ActionKind::Navigate => action.str_arg("url").map(str::to_string),
            ActionKind::Search => Some(self.settings.search_url.clone()),
            _ => None,
        }
    }

    /// Loads `url` directly, bypassing the action pipeline. Used for the start URL.
    pub async fn navigate_to(&mut self, url: &str) -> WebClawResult<()> {
        match tokio::time::timeout(self.settings.action_timeout, self.driver.navigate(url)).await {
            Ok(result) => result,
            Err(_) => Err(WebClawError::ActionExecution(format!(
                "navigation to {url} timed out"
            ))),
        }
    }

    pub async fn capture_snapshot(&mut self) -> WebClawResult<Snapshot> {
        let snapshot = self.driver.snapshot().await?;
        tracing::debug!(
            url = %snapshot.url,
            title = %snapshot.title,
            bytes = snapshot.image_len,
            "snapshot captured"
        );
        self.latest = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Runs one action. Per-action failures come back as `error` results;
    /// only fatal conditions (lost browser, failed snapshot) are `Err`.
    pub async fn execute(&mut self, action: &ActionRequest) -> WebClawResult<ActionResult> {
        let Some(kind) = ActionKind::from_name(&action.name) else {
            tracing::warn!(action = %action.name, "unknown action requested");
            let err = WebClawError::UnknownAction(action.name.clone());
            return Ok(ActionResult::error(action, err.to_string()));
        };

        if self.settings.excluded.iter().any(|e| e == kind.as_str() || *e == action.name) {
            return Ok(ActionResult::error(
                action,
                format!("Action '{}' is disabled in strict safety mode", action.name),
            ));
        }

        let args = Value::Object(action.args.clone());
        tracing::info!(action = %action.name, args = %args, "executing action");

        let limit = self.settings.action_timeout;
        let outcome = tokio::time::timeout(limit, self.perform(kind, action)).await;

        let mut payload = match outcome {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) if e.is_fatal() => {
                tracing::error!(action = %action.name, error = %e, "browser failure is fatal");
                return Err(e);
            }
            Ok(Err(e)) => {
                tracing::warn!(action = %action.name, error = %e, "action failed");
                return Ok(ActionResult::error(action, e.to_string()));
            }
            Err(_) => {
                tracing::warn!(action = %action.name, timeout_ms = limit.as_millis() as u64, "action timed out");
                return Ok(ActionResult::error(
                    action,
                    format!("Action '{}' timed out after {}ms", action.name, limit.as_millis()),
                ));
            }
        };

        // Every successful action except a pure page-info query refreshes the
        // snapshot so the next observation reflects the latest state.
        if kind != ActionKind::GetPageInfo {
            let snapshot = self.capture_snapshot().await?;
            payload.insert("url".into(), json!(snapshot.url));
            payload.insert("title".into(), json!(snapshot.title));
        }

        Ok(ActionResult::success(action, payload))
    }

    async fn perform(&self, kind: ActionKind, action: &ActionRequest) -> WebClawResult<Map<String, Value>> {
        let args = &action.args;
        let vp = self.viewport();
        let mut payload = Map::new();

        match kind {
            ActionKind::Navigate => {
                let url = action.str_arg("url").filter(|u| !u.trim().is_empty()).ok_or_else(|| {
                    WebClawError::ActionExecution("navigate requires a 'url' argument".into())
                })?;
                self.driver.navigate(url).await?;
            }
            ActionKind::Search => {
                self.driver.navigate(&self.settings.search_url).await?;
            }
            ActionKind::ClickAt => {
                let (x, y) = denormalize_args(args, "x", "y", vp)?;
                self.driver.click(x, y).await?;
                payload.insert("position".into(), json!({"x": x, "y": y}));
            }
            ActionKind::HoverAt => {
                let (x, y) = denormalize_args(args, "x", "y", vp)?;
                self.driver.hover(x, y).await?;
                payload.insert("position".into(), json!({"x": x, "y": y}));
            }
            ActionKind::TypeTextAt => {
                let (x, y) = denormalize_args(args, "x", "y", vp)?;
                let text = action.str_arg("text").ok_or_else(|| {
                    WebClawError::ActionExecution("type_text_at requires a 'text' argument".into())
                })?;
                let clear = bool_arg(args, "clear_before_typing", true);
                let enter = bool_arg(args, "press_enter", true);

                self.driver.click(x, y).await?;
                if clear {
                    self.driver.press_keys("Control+a").await?;
                    self.driver.press_keys("Backspace").await?;
                }
                self.driver.type_text(text).await?;
                if enter {
                    self.driver.press_keys("Enter").await?;
                }
                payload.insert("position".into(), json!({"x": x, "y": y}));
                payload.insert("typed_chars".into(), json!(text.chars().count()));
            }
            ActionKind::ScrollDocument => {
                let direction = direction_arg(args)?;
                let (dx, dy) = direction.delta(vp.width as i64, vp.height as i64);
                self.driver.scroll(None, dx, dy).await?;
                payload.insert("direction".into(), json!(direction.as_str()));
            }
            ActionKind::ScrollAt => {
                let (x, y) = denormalize_args(args, "x", "y", vp)?;
                let direction = direction_arg(args)?;
                let magnitude = args
                    .get("magnitude")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_SCROLL_MAGNITUDE);
                let (dx, dy) = direction.delta(
                    scale_magnitude(magnitude, vp.width),
                    scale_magnitude(magnitude, vp.height),
                );
                self.driver.scroll(Some((x, y)), dx, dy).await?;
                payload.insert("position".into(), json!({"x": x, "y": y}));
                payload.insert("direction".into(), json!(direction.as_str()));
            }
            ActionKind::Wait => {
                let seconds = if action.name == "wait_5_seconds" {
                    5
                } else {
                    args.get("seconds")
                        .and_then(Value::as_u64)
                        .unwrap_or(self.settings.wait_seconds)
                };
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                payload.insert("waited_seconds".into(), json!(seconds));
            }
            ActionKind::GoBack => self.driver.go_back().await?,
            ActionKind::GoForward => self.driver.go_forward().await?,
            ActionKind::KeyCombination => {
                let keys = action.str_arg("keys").filter(|k| !k.trim().is_empty()).ok_or_else(|| {
                    WebClawError::ActionExecution("key_combination requires a 'keys' argument".into())
                })?;
                self.driver.press_keys(keys).await?;
                payload.insert("keys".into(), json!(keys));
            }
            ActionKind::TakeScreenshot => {}
            ActionKind::GetPageInfo => {
                let info = self.driver.page_info().await?;
                payload.insert("url".into(), json!(info.url));
                payload.insert("title".into(), json!(info.title));
                payload.insert("viewport".into(), json!(vp));
            }
        }
        Ok(payload)
    }

    /// Tears the browser down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.driver.close().await {
            tracing::warn!(error = %e, "closing browser failed");
        } else {
            tracing::info!("browser closed");
        }
    }
}

fn bool_arg(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    match args.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !matches!(s.to_ascii_lowercase().as_str(), "false" | "0" | "no"),
        _ => default,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    fn delta(self, horizontal: i64, vertical: i64) -> (i64, i64) {
        match self {
            Direction::Up => (0, -vertical),
            Direction::Down => (0, vertical),
            Direction::Left => (-horizontal, 0),
            Direction::Right => (horizontal, 0),
        }
    }
}

fn direction_arg(args: &Map<String, Value>) -> WebClawResult<Direction> {
    match args.get("direction").and_then(Value::as_str).unwrap_or("down") {
        "up" => Ok(Direction::Up),
        "down" => Ok(Direction::Down),
        "left" => Ok(Direction::Left),
        "right" => Ok(Direction::Right),
        other => Err(WebClawError::ActionExecution(format!(
            "unsupported scroll direction '{other}'"
        ))),
    }
}
