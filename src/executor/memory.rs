// In-memory browser: a page history with titles and an operation log.
// Backs `webclaw run --offline` and the dispatcher/controller tests.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{WebClawError, WebClawResult};
use crate::executor::coordinator::Viewport;
use crate::executor::driver::{BrowserDriver, PageInfo};

/// PNG signature followed by an empty IHDR-sized body. Enough for size accounting.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R',
];

#[derive(Debug, Default)]
struct PageState {
    titles: HashMap<String, String>,
    history: Vec<String>,
    cursor: usize,
    ops: Vec<String>,
    fail_next: Option<String>,
    lost: bool,
    closed: bool,
    delay: Option<Duration>,
}

impl PageState {
    fn current(&self) -> Option<&String> {
        self.history.get(self.cursor)
    }
}

/// Cloning shares the underlying page, so a test can keep a handle while the
/// dispatcher owns another.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    viewport: Viewport,
    state: Arc<Mutex<PageState>>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(Viewport::new(1440, 900))
    }
}

impl MemoryDriver {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            state: Arc::new(Mutex::new(PageState::default())),
        }
    }

    /// Registers the title shown once `url` is loaded.
    pub fn with_page(self, url: &str, title: &str) -> Self {
        self.lock().titles.insert(url.to_string(), title.to_string());
        self
    }

    /// Operations performed so far, e.g. `click 720,450`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    /// Makes the next operation fail with a recoverable browser error.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    /// Every later operation reports the browser as gone.
    pub fn lose_connection(&self) {
        self.lock().lost = true;
    }

    /// Delays every operation, for timeout handling.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn perform<T>(
        &self,
        op: Option<String>,
        apply: impl FnOnce(&mut PageState) -> WebClawResult<T>,
    ) -> WebClawResult<T> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.lost || state.closed {
            return Err(WebClawError::BrowserLost("connection closed".into()));
        }
        if let Some(message) = state.fail_next.take() {
            return Err(WebClawError::Browser(message));
        }
        let value = apply(&mut state)?;
        if let Some(op) = op {
            state.ops.push(op);
        }
        Ok(value)
    }
}

fn title_for(state: &PageState, url: &str) -> String {
    if let Some(title) = state.titles.get(url) {
        return title.clone();
    }
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[async_trait]
impl BrowserDriver for MemoryDriver {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn navigate(&self, url: &str) -> WebClawResult<()> {
        let url = url.to_string();
        self.perform(Some(format!("navigate {url}")), move |s| {
            if !s.history.is_empty() {
                let keep = s.cursor + 1;
                s.history.truncate(keep);
            }
            s.history.push(url);
            s.cursor = s.history.len() - 1;
            Ok(())
        })
        .await
    }

    async fn click(&self, x: u32, y: u32) -> WebClawResult<()> {
        self.perform(Some(format!("click {x},{y}")), |_| Ok(())).await
    }

    async fn hover(&self, x: u32, y: u32) -> WebClawResult<()> {
        self.perform(Some(format!("hover {x},{y}")), |_| Ok(())).await
    }

    async fn type_text(&self, text: &str) -> WebClawResult<()> {
        self.perform(Some(format!("type {text}")), |_| Ok(())).await
    }

    async fn press_keys(&self, keys: &str) -> WebClawResult<()> {
        self.perform(Some(format!("keys {keys}")), |_| Ok(())).await
    }

    async fn scroll(&self, at: Option<(u32, u32)>, dx: i64, dy: i64) -> WebClawResult<()> {
        let op = match at {
            Some((x, y)) => format!("scroll at {x},{y} by {dx},{dy}"),
            None => format!("scroll by {dx},{dy}"),
        };
        self.perform(Some(op), |_| Ok(())).await
    }

    async fn go_back(&self) -> WebClawResult<()> {
        self.perform(Some("back".into()), |s| {
            s.cursor = s.cursor.saturating_sub(1);
            Ok(())
        })
        .await
    }

    async fn go_forward(&self) -> WebClawResult<()> {
        self.perform(Some("forward".into()), |s| {
            if s.cursor + 1 < s.history.len() {
                s.cursor += 1;
            }
            Ok(())
        })
        .await
    }

    async fn page_info(&self) -> WebClawResult<PageInfo> {
        self.perform(None, |s| {
            Ok(match s.current() {
                Some(url) => PageInfo {
                    title: title_for(s, url),
                    url: url.clone(),
                },
                None => PageInfo {
                    url: "about:blank".into(),
                    title: String::new(),
                },
            })
        })
        .await
    }

    async fn screenshot(&self) -> WebClawResult<Vec<u8>> {
        self.perform(None, |_| Ok(PLACEHOLDER_PNG.to_vec())).await
    }

    async fn close(&self) -> WebClawResult<()> {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.ops.push("close".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_follows_navigation() {
        let driver = MemoryDriver::default().with_page("https://a.test/", "Page A");
        driver.navigate("https://a.test/").await.unwrap();
        driver.navigate("https://b.test/docs").await.unwrap();

        let info = driver.page_info().await.unwrap();
        assert_eq!(info.url, "https://b.test/docs");
        assert_eq!(info.title, "b.test");

        driver.go_back().await.unwrap();
        assert_eq!(driver.page_info().await.unwrap().title, "Page A");
        driver.go_forward().await.unwrap();
        assert_eq!(driver.page_info().await.unwrap().url, "https://b.test/docs");
    }

    #[tokio::test]
    async fn blank_until_first_navigation() {
        let driver = MemoryDriver::default();
        let snapshot = driver.snapshot().await.unwrap();
        assert_eq!(snapshot.url, "about:blank");
        assert_eq!(snapshot.image_len, PLACEHOLDER_PNG.len());
    }

    #[tokio::test]
    async fn closed_driver_is_lost() {
        let driver = MemoryDriver::default();
        driver.close().await.unwrap();
        let err = driver.click(1, 1).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
