use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use webclaw::agent_engine::event_bus::{AgentEvent, EventBus};
use webclaw::agent_engine::state::TaskRequest;
use webclaw::config::{self, AppConfig, ConfirmationMode};
use webclaw::errors::WebClawResult;
use webclaw::executor::dispatcher::{ActionDispatcher, DispatchSettings};
use webclaw::executor::domain::DomainGate;
use webclaw::llm::registry::{api_key_env_var, ProviderRegistry};
use webclaw::{init_tracing, launch_driver, run_task, RunOptions};

#[derive(Parser)]
#[command(name = "webclaw", version, about = "Drive a browser from a natural-language instruction")]
struct Cli {
    /// Path to config.toml (default: next to the executable, then the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task and print the outcome as JSON
    Run(RunArgs),

    /// Verify configuration, API keys and that the browser can load a page
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// What the agent should do
    instruction: String,

    #[arg(long)]
    start_url: Option<String>,

    #[arg(long)]
    max_turns: Option<u32>,

    /// Only honour model-declared risk; offer the full action set
    #[arg(long)]
    no_strict: bool,

    /// Show the browser window
    #[arg(long, conflicts_with = "headless")]
    headed: bool,

    #[arg(long)]
    headless: bool,

    /// Override [safety].confirmation
    #[arg(long, value_enum)]
    confirm: Option<ConfirmArg>,

    /// Use the in-memory page model instead of Chrome
    #[arg(long)]
    offline: bool,

    /// Do not write the session record
    #[arg(long)]
    no_record: bool,
}

#[derive(Args)]
struct CheckArgs {
    /// Page loaded to prove the browser works
    #[arg(long, default_value = "https://example.com")]
    url: String,

    /// Skip launching the browser
    #[arg(long)]
    skip_browser: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfirmArg {
    Deny,
    Allow,
    Prompt,
}

impl From<ConfirmArg> for ConfirmationMode {
    fn from(arg: ConfirmArg) -> Self {
        match arg {
            ConfirmArg::Deny => ConfirmationMode::Deny,
            ConfirmArg::Allow => ConfirmationMode::Allow,
            ConfirmArg::Prompt => ConfirmationMode::Prompt,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let mut config = match config::load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("webclaw: {e}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => run(&mut config, args).await,
        Commands::Check(args) => check(&config, args).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("webclaw: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: &mut AppConfig, args: RunArgs) -> WebClawResult<bool> {
    if args.headed {
        config.browser.headless = false;
    } else if args.headless {
        config.browser.headless = true;
    }
    if let Some(mode) = args.confirm {
        config.safety.confirmation = mode.into();
    }

    let mut task = TaskRequest::new(args.instruction)
        .with_max_turns(args.max_turns.unwrap_or(config.agent.max_turns))
        .with_safety_strict(config.safety.strict && !args.no_strict);
    if let Some(url) = args.start_url {
        task = task.with_start_url(url);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling task");
            on_signal.cancel();
        }
    });

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if print_progress(&event) {
                break;
            }
        }
    });

    let outcome = run_task(
        config,
        task,
        RunOptions {
            offline: args.offline,
            cancel,
            events: Some(events),
            no_record: args.no_record,
        },
    )
    .await?;
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.success)
}

/// Human-readable progress on stderr. Returns true once the task is over.
fn print_progress(event: &AgentEvent) -> bool {
    match event {
        AgentEvent::TaskStarted { session_id, .. } => eprintln!("session {session_id}"),
        AgentEvent::TurnStarted { turn } => eprintln!("turn {turn}"),
        AgentEvent::ActionRequested { name, args, .. } => eprintln!("  → {name} {args}"),
        AgentEvent::ConfirmationRequired { name, reason, .. } => {
            eprintln!("  ! {name} needs confirmation: {reason}")
        }
        AgentEvent::ActionCompleted {
            name, status, error, ..
        } => match error {
            Some(err) => eprintln!("  ← {name} {status:?}: {err}"),
            None => eprintln!("  ← {name} {status:?}"),
        },
        AgentEvent::TurnCompleted { url, title, .. } => eprintln!("  @ {title} <{url}>"),
        AgentEvent::TaskFinished { .. } => return true,
    }
    false
}

async fn check(config: &AppConfig, args: CheckArgs) -> WebClawResult<bool> {
    let mut ok = true;

    let registry = ProviderRegistry::from_config(config);
    println!("providers: {}", registry.list_names().join(", "));
    for (id, entry) in &config.llm.providers {
        let var = api_key_env_var(id);
        let has_key = std::env::var(&var).is_ok_and(|k| !k.is_empty())
            || entry.api_key.as_deref().is_some_and(|k| !k.is_empty());
        println!(
            "  {id}: {} ({}) key {}",
            entry.display_name,
            entry.model,
            if has_key { "present" } else { "MISSING" }
        );
        if !has_key && *id == config.llm.active_provider {
            eprintln!("  set {var} or api_key in config.toml");
            ok = false;
        }
    }
    match registry.call_config_for_role("tools") {
        Ok((provider, call)) => println!("tools role: {} / {}", provider.name(), call.model),
        Err(e) => {
            println!("tools role: {e}");
            ok = false;
        }
    }

    let gate = DomainGate::new(config.safety.allowed_domains.clone());
    if gate.is_restricted() {
        println!("allowed domains: {}", gate.allow_list().join(", "));
    } else {
        println!("allowed domains: unrestricted");
    }

    if args.skip_browser {
        return Ok(ok);
    }
    let driver = launch_driver(config, false).await?;
    let mut dispatcher = ActionDispatcher::new(driver, DispatchSettings::from(&config.browser));
    let loaded = match dispatcher.navigate_to(&args.url).await {
        Ok(()) => dispatcher.capture_snapshot().await,
        Err(e) => Err(e),
    };
    match loaded {
        Ok(snapshot) => println!(
            "browser: loaded {} ({:?}, {} byte screenshot)",
            snapshot.url, snapshot.title, snapshot.image_len
        ),
        Err(e) => {
            println!("browser: {e}");
            ok = false;
        }
    }
    dispatcher.shutdown().await;
    Ok(ok)
}
