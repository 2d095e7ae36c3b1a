//! LLM-driven command console.
//!
//! Connects to a local Ollama server, asks the user for a goal, and lets the
//! model answer with questions or code that runs on this machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nomi::cancel::is_cancelled;
use nomi::exit_codes;
use nomi::io::bridge::CompletionBridge;
use nomi::io::completion::CompletionProvider;
use nomi::io::config::{ConsoleConfig, OLLAMA_URL_ENV, load_config};
use nomi::io::dispatch::Dispatcher;
use nomi::io::executor::ExecutorRegistry;
use nomi::io::input::StdinInput;
use nomi::io::ollama::OllamaProvider;
use nomi::io::prompt::system_instruction;
use nomi::logging;
use nomi::session::Session;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = ".nomi/config.toml";

#[derive(Parser)]
#[command(
    name = "nomi",
    version,
    about = "Describe a goal; a local model answers with code that runs here"
)]
struct Cli {
    /// Model to chat with (overrides the config file).
    #[arg(short, long)]
    model: Option<String>,

    /// Path to the TOML config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(()) => exit_codes::OK,
        Err(err) if is_cancelled(&err) => {
            debug!("session cancelled");
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let env_url = std::env::var(OLLAMA_URL_ENV).ok();
    let config = load_config(&cli.config)?
        .with_overrides(cli.model.as_deref(), env_url.as_deref())
        .context("apply overrides")?;

    let registry = Arc::new(ExecutorRegistry::with_defaults());
    let dispatcher = Dispatcher::new(registry, config.process_limits());
    let instruction = system_instruction(dispatcher.os(), &dispatcher.languages())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let result = runtime.block_on(console(config, dispatcher, instruction));
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn console(
    config: ConsoleConfig,
    dispatcher: Dispatcher,
    instruction: String,
) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let provider = Arc::new(OllamaProvider::new(
        &config.ollama_url,
        &config.model,
        config.request_timeout(),
    )?);
    ensure_model(&provider, &cancel).await?;

    let bridge = CompletionBridge::new(provider, config.completion_channel_capacity);
    let mut input = StdinInput::new();
    let mut session = Session::new(
        &bridge,
        &dispatcher,
        &mut input,
        std::io::stdout(),
        instruction,
    );
    let outcome = session.run(&cancel).await?;
    info!(
        completions = outcome.completions,
        executed_blocks = outcome.executed_blocks,
        "session finished"
    );
    Ok(())
}

/// Verify the server is reachable and pull the model if it isn't installed.
async fn ensure_model(provider: &OllamaProvider, cancel: &CancellationToken) -> Result<()> {
    let check = async {
        if provider.has_model().await? {
            return Ok(());
        }
        println!("Pulling model {}...", provider.model());
        provider.pull_model().await
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(nomi::cancel::Cancelled.into()),
        result = check => result,
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    println!("\nSignal received, quitting...");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            debug!(err = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
