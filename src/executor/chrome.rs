// Chrome-backed BrowserDriver (headless_chrome over CDP).
use std::ffi::OsStr;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};

use crate::config::BrowserSettings;
use crate::errors::{WebClawError, WebClawResult};
use crate::executor::coordinator::Viewport;
use crate::executor::driver::{BrowserDriver, PageInfo};

pub struct ChromeDriver {
    // Dropping the Browser kills the Chrome process, so it lives as long as the tab.
    _browser: Browser,
    tab: Arc<Tab>,
    viewport: Viewport,
    closed: AtomicBool,
}

impl ChromeDriver {
    /// Launches Chrome and takes its first tab. Blocking; call from
    /// `spawn_blocking` or before entering the async loop.
    pub fn launch(settings: &BrowserSettings) -> WebClawResult<Self> {
        tracing::info!(
            headless = settings.headless,
            width = settings.width,
            height = settings.height,
            "launching browser"
        );

        let args: Vec<String> = vec![
            format!("--window-size={},{}", settings.width, settings.height),
            "--no-sandbox".to_string(),
            "--disable-setuid-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-gpu".to_string(),
        ];
        let os_args: Vec<&OsStr> = args.iter().map(OsStr::new).collect();

        let options = LaunchOptionsBuilder::default()
            .headless(settings.headless)
            .window_size(Some((settings.width, settings.height)))
            .args(os_args)
            .build()
            .map_err(|e| WebClawError::Browser(format!("failed to build launch options: {e}")))?;

        let browser = Browser::new(options)
            .map_err(|e| WebClawError::Browser(format!("failed to launch browser: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| WebClawError::Browser(format!("failed to open tab: {e}")))?;
        tab.set_default_timeout(Duration::from_millis(settings.action_timeout_ms));

        tracing::info!("browser ready");
        Ok(Self {
            _browser: browser,
            tab,
            viewport: Viewport::new(settings.width, settings.height),
            closed: AtomicBool::new(false),
        })
    }

    /// Runs a blocking CDP call off the async runtime.
    async fn blocking<T, E, F>(&self, op: &'static str, f: F) -> WebClawResult<T>
    where
        T: Send + 'static,
        E: Display,
        F: FnOnce(Arc<Tab>) -> Result<T, E> + Send + 'static,
        E: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WebClawError::BrowserLost("browser already closed".into()));
        }
        let tab = Arc::clone(&self.tab);
        let joined = tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| WebClawError::Browser(format!("{op}: worker panicked: {e}")))?;
        joined.map_err(|e| classify_failure(op, &e.to_string()))
    }

    async fn eval(&self, op: &'static str, script: String) -> WebClawResult<()> {
        self.blocking(op, move |tab| tab.evaluate(&script, false).map(|_| ()))
            .await
    }
}

fn classify_failure(op: &str, message: &str) -> WebClawError {
    let lower = message.to_ascii_lowercase();
    let lost = ["connection is closed", "connection closed", "target closed", "tab crashed"]
        .iter()
        .any(|m| lower.contains(m));
    if lost {
        WebClawError::BrowserLost(format!("{op}: {message}"))
    } else {
        WebClawError::Browser(format!("{op}: {message}"))
    }
}

/// Splits `Control+Shift+t` into modifiers and the final key.
fn parse_chord(keys: &str) -> (Vec<ModifierKey>, String) {
    let parts: Vec<&str> = keys.split('+').map(str::trim).filter(|p| !p.is_empty()).collect();
    let Some((last, mods)) = parts.split_last() else {
        return (Vec::new(), String::new());
    };
    let modifiers = mods
        .iter()
        .filter_map(|m| match m.to_ascii_lowercase().as_str() {
            "control" | "ctrl" => Some(ModifierKey::Ctrl),
            "shift" => Some(ModifierKey::Shift),
            "alt" | "option" => Some(ModifierKey::Alt),
            "meta" | "cmd" | "command" | "super" => Some(ModifierKey::Meta),
            _ => None,
        })
        .collect();
    let key = match last.to_ascii_lowercase().as_str() {
        "return" => "Enter".to_string(),
        "esc" => "Escape".to_string(),
        "del" => "Delete".to_string(),
        "space" => " ".to_string(),
        _ => last.to_string(),
    };
    (modifiers, key)
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn navigate(&self, url: &str) -> WebClawResult<()> {
        tracing::info!(url, "navigating");
        let url = url.to_string();
        self.blocking("navigate", move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ())
        })
        .await
    }

    async fn click(&self, x: u32, y: u32) -> WebClawResult<()> {
        let point = Point { x: x as f64, y: y as f64 };
        self.blocking("click", move |tab| tab.click_point(point).map(|_| ()))
            .await
    }

    async fn hover(&self, x: u32, y: u32) -> WebClawResult<()> {
        let point = Point { x: x as f64, y: y as f64 };
        self.blocking("hover", move |tab| tab.move_mouse_to_point(point).map(|_| ()))
            .await
    }

    async fn type_text(&self, text: &str) -> WebClawResult<()> {
        let text = text.to_string();
        self.blocking("type", move |tab| tab.type_str(&text).map(|_| ()))
            .await
    }

    async fn press_keys(&self, keys: &str) -> WebClawResult<()> {
        let (modifiers, key) = parse_chord(keys);
        if key.is_empty() {
            return Err(WebClawError::ActionExecution(format!("no key in '{keys}'")));
        }
        self.blocking("press_keys", move |tab| {
            if modifiers.is_empty() {
                tab.press_key(&key).map(|_| ())
            } else {
                tab.press_key_with_modifiers(&key, Some(modifiers.as_slice())).map(|_| ())
            }
        })
        .await
    }

    async fn scroll(&self, at: Option<(u32, u32)>, dx: i64, dy: i64) -> WebClawResult<()> {
        let script = match at {
            None => format!("window.scrollBy({dx}, {dy})"),
            Some((x, y)) => format!(
                "(() => {{ let el = document.elementFromPoint({x}, {y}); \
                 while (el && el !== document.body && !(el.scrollHeight > el.clientHeight || el.scrollWidth > el.clientWidth)) \
                 {{ el = el.parentElement; }} \
                 (el && el !== document.body ? el : window).scrollBy({dx}, {dy}); }})()"
            ),
        };
        self.eval("scroll", script).await
    }

    async fn go_back(&self) -> WebClawResult<()> {
        self.eval("go_back", "history.back()".into()).await?;
        self.blocking("go_back", |tab| tab.wait_until_navigated().map(|_| ()))
            .await
    }

    async fn go_forward(&self) -> WebClawResult<()> {
        self.eval("go_forward", "history.forward()".into()).await?;
        self.blocking("go_forward", |tab| tab.wait_until_navigated().map(|_| ()))
            .await
    }

    async fn page_info(&self) -> WebClawResult<PageInfo> {
        self.blocking("page_info", |tab| {
            tab.get_title().map(|title| PageInfo {
                url: tab.get_url(),
                title,
            })
        })
        .await
    }

    async fn screenshot(&self) -> WebClawResult<Vec<u8>> {
        let png = self
            .blocking("screenshot", |tab| {
                tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            })
            .await?;
        tracing::debug!(bytes = png.len(), "screenshot captured");
        Ok(png)
    }

    async fn close(&self) -> WebClawResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tab = Arc::clone(&self.tab);
        let closed = tokio::task::spawn_blocking(move || tab.close(true))
            .await
            .map_err(|e| WebClawError::Browser(format!("close: worker panicked: {e}")))?;
        closed
            .map(|_| ())
            .map_err(|e| WebClawError::Browser(format!("close: {e}")))
    }
}
