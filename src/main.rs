//! lmkeyd: global-hotkey bridge between the clipboard and a local LM Studio
//! server. Each configured hotkey slot captures clipboard text, sends it
//! with a system prompt to the server, and delivers the response back to
//! the clipboard (optionally injecting a paste keystroke).

mod config;
mod desktop;
mod dispatch;
mod hotkey;
mod listener;
mod loader;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, FileConfig, Overrides};
use crate::desktop::{Desktop, XDesktop};
use crate::dispatch::Dispatcher;
use crate::hotkey::HotkeyError;
use crate::hotkey::x11::X11Context;
use crate::listener::{EventLoop, InvocationError, SlotRegistry};
use crate::loader::{Clock, LmsCli, LoadStrategy, ModelGate, SystemClock};
use crate::server::{InferenceBackend, LmStudioClient};

#[derive(Parser, Debug)]
#[command(name = "lmkeyd", version, about = "Clipboard-to-LM-Studio hotkey daemon")]
struct Cli {
    /// JSON config file defining hotkey slots.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Inference server base URL.
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Model auto-load strategy.
    #[arg(long, value_enum)]
    load_strategy: Option<LoadStrategy>,

    /// Overall request budget in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Model id, overriding every slot.
    #[arg(long)]
    model: Option<String>,

    /// Inline system prompt.
    #[arg(short = 's', long, conflicts_with = "system_prompt_file")]
    system_prompt: Option<String>,

    /// File containing the system prompt.
    #[arg(short = 'f', long, value_name = "FILE")]
    system_prompt_file: Option<PathBuf>,

    /// Inject a copy-selection action before reading the clipboard.
    #[arg(long)]
    auto_copy: bool,

    /// Inject a paste keystroke after delivering the response.
    #[arg(long)]
    auto_paste: bool,

    /// Key combo for --auto-paste (default ctrl+v).
    #[arg(long, value_name = "COMBO")]
    paste_keys: Option<String>,

    /// Run slot N once and exit instead of listening.
    #[arg(long, value_name = "N")]
    run_hotkey: Option<u32>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hotkey(#[from] HotkeyError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let overrides = Overrides {
        base_url: cli.base_url,
        load_strategy: cli.load_strategy,
        timeout_secs: cli.timeout,
        model: cli.model,
        system_prompt: cli.system_prompt,
        system_prompt_file: cli.system_prompt_file,
        auto_copy: cli.auto_copy,
        auto_paste: cli.auto_paste,
        paste_keys: cli.paste_keys,
        run_hotkey: cli.run_hotkey,
    };
    let settings = config::resolve(
        file,
        overrides,
        std::env::var(config::TIMEOUT_ENV).ok(),
        std::env::var(config::SYSTEM_PROMPT_ENV).ok(),
    )?;

    tracing::info!(
        base_url = %settings.base_url,
        strategy = ?settings.load_strategy,
        timeout_secs = settings.timeout.as_secs(),
        slots = settings.profiles.len(),
        "configured"
    );

    let backend: Arc<dyn InferenceBackend> =
        Arc::new(LmStudioClient::new(settings.base_url.clone(), settings.timeout));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gate = ModelGate::new(
        backend.clone(),
        Arc::new(LmsCli::default()),
        clock,
        ModelGate::DEFAULT_POLL_INTERVAL,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        backend,
        gate,
        settings.load_strategy,
        settings.timeout,
    ));
    let desktop: Arc<dyn Desktop> = Arc::new(XDesktop::new());
    let registry = SlotRegistry::new(&settings.profiles)?;

    if let Some(slot_id) = settings.run_once_slot {
        listener::run_once(&registry, slot_id, &dispatcher, desktop.as_ref()).await?;
        return Ok(());
    }

    let x11 = X11Context::connect()?;
    EventLoop::new(registry, dispatcher, desktop).run(x11).await?;
    Ok(())
}
