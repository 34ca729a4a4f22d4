pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;

use tokio_util::sync::CancellationToken;

use crate::agent_engine::engine::TurnController;
use crate::agent_engine::event_bus::EventBus;
use crate::agent_engine::history::SessionStore;
use crate::agent_engine::state::{AgentOutcome, TaskRequest};
use crate::config::AppConfig;
use crate::errors::{WebClawError, WebClawResult};
use crate::executor::chrome::ChromeDriver;
use crate::executor::confirm::gate_from_config;
use crate::executor::coordinator::Viewport;
use crate::executor::dispatcher::{ActionDispatcher, DispatchSettings};
use crate::executor::driver::BrowserDriver;
use crate::executor::memory::MemoryDriver;
use crate::llm::registry::ProviderRegistry;

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-run wiring that does not belong in `config.toml`.
#[derive(Default)]
pub struct RunOptions {
    /// Use the in-memory page model instead of launching Chrome.
    pub offline: bool,
    pub cancel: CancellationToken,
    pub events: Option<EventBus>,
    /// Skip writing the session record and journal.
    pub no_record: bool,
}

/// Launches the configured browser off the async runtime.
pub async fn launch_driver(config: &AppConfig, offline: bool) -> WebClawResult<Box<dyn BrowserDriver>> {
    if offline {
        tracing::info!("using in-memory browser");
        let viewport = Viewport::new(config.browser.width, config.browser.height);
        return Ok(Box::new(MemoryDriver::new(viewport)));
    }
    let settings = config.browser.clone();
    let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&settings))
        .await
        .map_err(|e| WebClawError::Browser(format!("browser launch task failed: {e}")))??;
    Ok(Box::new(driver))
}

/// One-shot task entry point used by the CLI: builds the provider registry,
/// browser, confirmation gate and controller, runs the task, then closes the
/// browser.
pub async fn run_task(
    config: &AppConfig,
    task: TaskRequest,
    options: RunOptions,
) -> WebClawResult<AgentOutcome> {
    let registry = ProviderRegistry::from_config(config);
    tracing::info!(providers = ?registry.list_names(), "provider registry ready");
    // Resolved before launch so a bad role never leaves a browser behind.
    let (provider, call_config) = registry.call_config_for_role("tools")?;

    let driver = launch_driver(config, options.offline).await?;
    let dispatcher = ActionDispatcher::new(driver, DispatchSettings::from(&config.browser));
    let gate = gate_from_config(&config.safety);

    let mut controller = TurnController::new(provider, call_config, dispatcher, gate, config)
        .with_cancellation(options.cancel);
    if let Some(bus) = options.events {
        controller = controller.with_event_bus(bus);
    }
    if !options.no_record {
        controller = controller.with_session_store(SessionStore::from_settings(&config.agent));
    }

    let outcome = controller.run(task).await;
    controller.shutdown().await;
    Ok(outcome)
}
