// Browser input + observation primitives the dispatcher builds actions from.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::Snapshot;
use crate::errors::WebClawResult;
use crate::executor::coordinator::Viewport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// A live browser tab. Not safe for concurrent use: one driver belongs to one
/// session's dispatcher for the session's lifetime.
///
/// Implementations report a dead connection as `WebClawError::BrowserLost`;
/// every other failure is treated as recoverable for the action at hand.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn viewport(&self) -> Viewport;

    /// Navigates and waits for the load to settle.
    async fn navigate(&self, url: &str) -> WebClawResult<()>;

    async fn click(&self, x: u32, y: u32) -> WebClawResult<()>;

    async fn hover(&self, x: u32, y: u32) -> WebClawResult<()>;

    /// Types into whatever currently has focus.
    async fn type_text(&self, text: &str) -> WebClawResult<()>;

    /// Presses a key or a `+`-joined chord such as `Control+a`.
    async fn press_keys(&self, keys: &str) -> WebClawResult<()>;

    /// Scrolls the element under `at`, or the document when `at` is `None`.
    async fn scroll(&self, at: Option<(u32, u32)>, dx: i64, dy: i64) -> WebClawResult<()>;

    async fn go_back(&self) -> WebClawResult<()>;

    async fn go_forward(&self) -> WebClawResult<()>;

    async fn page_info(&self) -> WebClawResult<PageInfo>;

    /// PNG of the current viewport.
    async fn screenshot(&self) -> WebClawResult<Vec<u8>>;

    async fn snapshot(&self) -> WebClawResult<Snapshot> {
        let image = self.screenshot().await?;
        let info = self.page_info().await?;
        Ok(Snapshot::new(info.url, info.title, image))
    }

    async fn close(&self) -> WebClawResult<()>;
}
